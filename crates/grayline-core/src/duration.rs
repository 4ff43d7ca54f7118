//! Duration strings used in config files and alert rules.
//!
//! Accepts one or more `<integer><unit>` segments with units `ms`, `s`,
//! `m` and `h`, e.g. `"500ms"`, `"90s"`, `"5m"`, `"1h30m"`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("missing number before unit in {0:?}")]
    MissingNumber(String),

    #[error("missing unit after number in {0:?}")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in {input:?}")]
    UnknownUnit { input: String, unit: String },

    #[error("duration {0:?} overflows")]
    Overflow(String),
}

/// Parse a duration string like `"5m"` or `"1h30m"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let mut total_ms: u64 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(DurationError::MissingNumber(input.to_string()));
        }
        let (number, tail) = rest.split_at(digits);
        let unit_len = tail.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        if unit_len == 0 {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let (unit, tail) = tail.split_at(unit_len);

        let value: u64 = number
            .parse()
            .map_err(|_| DurationError::Overflow(input.to_string()))?;
        let factor = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            other => {
                return Err(DurationError::UnknownUnit {
                    input: input.to_string(),
                    unit: other.to_string(),
                });
            }
        };

        total_ms = value
            .checked_mul(factor)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| DurationError::Overflow(input.to_string()))?;
        rest = tail;
    }

    Ok(Duration::from_millis(total_ms))
}
