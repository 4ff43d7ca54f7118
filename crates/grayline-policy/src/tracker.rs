//! Sustained-breach tracking for one (application, rule) pair.

use std::time::Duration;

use grayline_state::HealthStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreachTracker {
    /// Sample time (unix seconds) of the first unhealthy sample of the
    /// current breach.
    pub breach_start: Option<u64>,
    /// The current breach already fired.
    pub sustained: bool,
}

impl BreachTracker {
    /// Feed one classification. Returns `true` exactly once per sustained
    /// breach: on the sample where the breach has lasted at least `window`.
    ///
    /// `unknown` leaves the tracker untouched.
    pub fn observe(&mut self, classification: HealthStatus, sampled_at: u64, window: Duration) -> bool {
        match classification {
            HealthStatus::Unknown => false,
            HealthStatus::Healthy => {
                self.breach_start = None;
                self.sustained = false;
                false
            }
            HealthStatus::Unhealthy => {
                let start = *self.breach_start.get_or_insert(sampled_at);
                if self.sustained {
                    return false;
                }
                if Duration::from_secs(sampled_at.saturating_sub(start)) >= window {
                    self.sustained = true;
                    return true;
                }
                false
            }
        }
    }

    /// Seconds the current breach has lasted at `now`.
    pub fn breach_secs(&self, now: u64) -> u64 {
        self.breach_start.map_or(0, |start| now.saturating_sub(start))
    }
}
