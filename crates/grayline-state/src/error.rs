//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    /// A redb transaction, table or I/O operation failed.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("cannot encode {table} record: {reason}")]
    Encode { table: String, reason: String },

    /// A stored record no longer matches the current schema.
    #[error("corrupt {table} record: {reason}")]
    Decode { table: String, reason: String },
}

impl StateError {
    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        StateError::Storage(e.to_string())
    }

    pub(crate) fn encode(table: &str, e: impl std::fmt::Display) -> Self {
        StateError::Encode {
            table: table.to_string(),
            reason: e.to_string(),
        }
    }

    pub(crate) fn decode(table: &str, e: impl std::fmt::Display) -> Self {
        StateError::Decode {
            table: table.to_string(),
            reason: e.to_string(),
        }
    }
}
