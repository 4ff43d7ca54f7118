//! Node state machine — the per-node transition table.
//!
//! Every `(status, action)` pair is spelled out in one `match` so adding a
//! status or an action forces each case to be revisited.

use std::fmt;
use std::str::FromStr;

use grayline_state::NodeStatus;
use serde::{Deserialize, Serialize};

/// Operator (or policy) action against a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Deploy,
    Retry,
    Skip,
    Rollback,
    Cancel,
}

impl NodeAction {
    pub const ALL: [NodeAction; 5] = [
        NodeAction::Deploy,
        NodeAction::Retry,
        NodeAction::Skip,
        NodeAction::Rollback,
        NodeAction::Cancel,
    ];

    /// Actions that hand the node to the execution channel and wait for a callback.
    pub fn starts_execution(self) -> bool {
        matches!(self, NodeAction::Deploy | NodeAction::Retry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeAction::Deploy => "deploy",
            NodeAction::Retry => "retry",
            NodeAction::Skip => "skip",
            NodeAction::Rollback => "rollback",
            NodeAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown node action {s:?}"))
    }
}

/// Result reported by the execution channel for a `deploying` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Facts about the node's surroundings that guards consult.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardContext {
    /// The node holds an in-flight execution guard.
    pub in_flight: bool,
    /// Some other node of the same deployment is `deploying`.
    pub sibling_deploying: bool,
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The action is not defined for the current status.
    NotAllowed,
    /// The node already has an execution in flight.
    InFlight,
    /// Rollback refused while a sibling is mid-deploy.
    SiblingDeploying,
}

/// Compute the next status for `action`, or the reason it is refused.
pub fn transition(
    from: NodeStatus,
    action: NodeAction,
    ctx: GuardContext,
) -> Result<NodeStatus, Rejection> {
    use NodeAction::*;
    use NodeStatus::*;

    match (from, action) {
        (Pending, Deploy) | (Failed, Retry) => {
            if ctx.in_flight {
                Err(Rejection::InFlight)
            } else {
                Ok(Deploying)
            }
        }
        (Deploying, Deploy | Retry) => Err(Rejection::InFlight),

        (Pending | Failed, Skip) => Ok(Skipped),

        (Success, Rollback) => {
            if ctx.sibling_deploying {
                Err(Rejection::SiblingDeploying)
            } else {
                Ok(RolledBack)
            }
        }

        (Pending | Deploying | Failed, Cancel) => Ok(Canceled),

        (Pending, Retry | Rollback)
        | (Deploying, Skip | Rollback)
        | (Success, Deploy | Retry | Skip | Cancel)
        | (Failed, Deploy | Rollback)
        | (Skipped, Deploy | Retry | Skip | Rollback | Cancel)
        | (RolledBack, Deploy | Retry | Skip | Rollback | Cancel)
        | (Canceled, Deploy | Retry | Skip | Rollback | Cancel) => Err(Rejection::NotAllowed),
    }
}

/// Apply an execution callback. Only `deploying` nodes accept one.
pub fn complete(from: NodeStatus, result: ExecutionStatus) -> Result<NodeStatus, Rejection> {
    match (from, result) {
        (NodeStatus::Deploying, ExecutionStatus::Success) => Ok(NodeStatus::Success),
        (NodeStatus::Deploying, ExecutionStatus::Failed) => Ok(NodeStatus::Failed),
        (
            NodeStatus::Pending
            | NodeStatus::Success
            | NodeStatus::Failed
            | NodeStatus::Skipped
            | NodeStatus::RolledBack
            | NodeStatus::Canceled,
            _,
        ) => Err(Rejection::NotAllowed),
    }
}
