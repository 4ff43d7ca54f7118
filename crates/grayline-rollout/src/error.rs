//! Rollout error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors surfaced by the rollout core.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// The action is not valid for the current node or deployment state.
    #[error("invalid action: {0}")]
    Validation(String),

    /// The node already has an operation in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A remote execution or metrics collaborator failed.
    #[error("external failure: {0}")]
    External(String),

    /// Malformed policy configuration.
    #[error("policy error: {0}")]
    Policy(String),

    #[error("state store error: {0}")]
    State(#[from] grayline_state::StateError),
}

/// Serializable discriminant of [`RolloutError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    External,
    Policy,
    Internal,
}

impl RolloutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RolloutError::Validation(_) => ErrorKind::Validation,
            RolloutError::Conflict(_) => ErrorKind::Conflict,
            RolloutError::NotFound(_) => ErrorKind::NotFound,
            RolloutError::External(_) => ErrorKind::External,
            RolloutError::Policy(_) => ErrorKind::Policy,
            RolloutError::State(_) => ErrorKind::Internal,
        }
    }
}
