//! grayline-rollout — gray release rollout core.
//!
//! Implements the per-node state machine, the deployment aggregate that
//! derives an overall status from its nodes, and the batch coordinator
//! that applies operator or policy actions to sets of nodes.
//!
//! # Flow
//!
//! ```text
//! apply(action, nodes) -> guard check -> transition -> aggregate
//!                                  \-> ExecutionPool -> callback
//! ```
//!
//! A gray node, when designated at creation, starts `deploying` right away.
//! Every other node waits for an explicit `deploy`.

pub mod coordinator;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod guard;
pub mod machine;

pub use coordinator::{Coordinator, NodeOutcome, NodeResult, RolloutEvent};
pub use deployment::{Deployment, NodeTransition, derive_status, installed_versions};
pub use error::{ErrorKind, RolloutError, RolloutResult};
pub use executor::{
    BoxFuture, CommandExecutor, ExecutionError, ExecutionOutcome, ExecutionPool,
    ExecutionRequest, Executor, MockExecutor,
};
pub use guard::{NodeGuard, NodeGuards};
pub use machine::{ExecutionStatus, NodeAction};
