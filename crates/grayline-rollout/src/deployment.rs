//! Deployment aggregate — owns its nodes and derives its status.
//!
//! Every mutation goes through [`Deployment`], which recomputes the
//! aggregate status and timestamps before returning. Callers never set the
//! status directly.

use std::collections::{HashMap, HashSet};

use grayline_state::{
    Application, Closure, DeploymentRecord, DeploymentStatus, NodeId, NodeRecord, NodeRef,
    NodeStatus, epoch_secs,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};
use crate::machine::{self, ExecutionStatus, GuardContext, NodeAction, Rejection};

/// A node status change produced by an action or callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransition {
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// Derive the aggregate status from node statuses and the closure flag.
pub fn derive_status<I>(statuses: I, closure: Option<Closure>) -> DeploymentStatus
where
    I: IntoIterator<Item = NodeStatus>,
{
    match closure {
        Some(Closure::Canceled) => return DeploymentStatus::Canceled,
        Some(Closure::RolledBack) => return DeploymentStatus::RolledBack,
        None => {}
    }

    let mut total = 0usize;
    let mut deploying = 0usize;
    let mut failed = 0usize;
    let mut success = 0usize;
    let mut counted = 0usize;
    let mut rolled_back = 0usize;

    for status in statuses {
        total += 1;
        match status {
            NodeStatus::Deploying => deploying += 1,
            NodeStatus::Failed => failed += 1,
            NodeStatus::Success => success += 1,
            NodeStatus::RolledBack => rolled_back += 1,
            NodeStatus::Pending | NodeStatus::Skipped | NodeStatus::Canceled => {}
        }
        if !matches!(status, NodeStatus::Skipped | NodeStatus::Canceled) {
            counted += 1;
        }
    }

    if deploying > 0 {
        DeploymentStatus::Deploying
    } else if failed > 0 {
        DeploymentStatus::Failed
    } else if counted > 0 && success == counted {
        DeploymentStatus::Success
    } else if total > 0 && rolled_back == total {
        DeploymentStatus::RolledBack
    } else {
        DeploymentStatus::Pending
    }
}


/// Version each node is running after `history`, oldest deployment first.
///
/// A `success` installs the deployment's version and a `rolled_back` node
/// returns to its recorded previous version. Other statuses leave the node
/// where it was.
pub fn installed_versions<'a, I>(history: I) -> HashMap<NodeId, String>
where
    I: IntoIterator<Item = &'a DeploymentRecord>,
{
    let mut ordered: Vec<&DeploymentRecord> = history.into_iter().collect();
    ordered.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let mut installed = HashMap::new();
    for record in ordered {
        for node in &record.nodes {
            match node.status {
                NodeStatus::Success => {
                    installed.insert(node.node.id.clone(), record.version.clone());
                }
                NodeStatus::RolledBack => match &node.previous_version {
                    Some(previous) => {
                        installed.insert(node.node.id.clone(), previous.clone());
                    }
                    None => {
                        installed.remove(&node.node.id);
                    }
                },
                NodeStatus::Pending
                | NodeStatus::Deploying
                | NodeStatus::Failed
                | NodeStatus::Skipped
                | NodeStatus::Canceled => {}
            }
        }
    }
    installed
}

/// A deployment and its nodes.
#[derive(Debug, Clone)]
pub struct Deployment {
    record: DeploymentRecord,
}

impl Deployment {
    /// Create a deployment for every node of `app`.
    ///
    /// All nodes start `pending`; the gray node, when given, starts
    /// `deploying` and must be dispatched by the caller.
    pub fn create(app: &Application, version: &str, gray_node: Option<&str>) -> RolloutResult<Self> {
        if app.nodes.is_empty() {
            return Err(RolloutError::Validation(format!(
                "application {} has no target nodes",
                app.name
            )));
        }
        if version.trim().is_empty() {
            return Err(RolloutError::Validation("version must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &app.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(RolloutError::Validation(format!(
                    "application {} lists node {} more than once",
                    app.name, node.id
                )));
            }
        }
        if let Some(gray) = gray_node {
            if !seen.contains(gray) {
                return Err(RolloutError::Validation(format!(
                    "gray node {gray} is not a target of application {}",
                    app.name
                )));
            }
        }

        let now = epoch_secs();
        let nodes = app
            .nodes
            .iter()
            .map(|node| {
                let is_gray = gray_node == Some(node.id.as_str());
                let mut record = NodeRecord {
                    node: node.clone(),
                    status: NodeStatus::Pending,
                    previous_version: None,
                    log: Vec::new(),
                    updated_at: now,
                };
                if is_gray {
                    record.status = NodeStatus::Deploying;
                    record
                        .log
                        .push(log_line(now, "gray deploy", NodeStatus::Pending, NodeStatus::Deploying));
                }
                record
            })
            .collect::<Vec<_>>();

        let mut deployment = Self {
            record: DeploymentRecord {
                id: uuid::Uuid::new_v4().to_string(),
                app: app.name.clone(),
                version: version.to_string(),
                gray_node: gray_node.map(str::to_string),
                nodes,
                status: DeploymentStatus::Pending,
                closure: None,
                created_at: now,
                updated_at: now,
            },
        };
        deployment.refresh(now);
        Ok(deployment)
    }

    /// Record what each node runs before this deployment touches it.
    pub fn with_previous_versions(mut self, installed: &HashMap<NodeId, String>) -> Self {
        for node in &mut self.record.nodes {
            node.previous_version = installed.get(&node.node.id).cloned();
        }
        self
    }

    /// Rehydrate from a persisted record, re-deriving the cached status.
    pub fn restore(record: DeploymentRecord) -> Self {
        let mut deployment = Self { record };
        deployment.record.status = deployment.derived();
        deployment
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn app(&self) -> &str {
        &self.record.app
    }

    pub fn status(&self) -> DeploymentStatus {
        self.record.status
    }

    pub fn record(&self) -> &DeploymentRecord {
        &self.record
    }

    pub fn into_record(self) -> DeploymentRecord {
        self.record
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.record.node(node_id)
    }

    pub fn any_deploying(&self) -> bool {
        self.record
            .nodes
            .iter()
            .any(|n| n.status == NodeStatus::Deploying)
    }

    /// Nodes currently `deploying`, in deployment order.
    pub fn deploying_nodes(&self) -> Vec<NodeRef> {
        self.record
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Deploying)
            .map(|n| n.node.clone())
            .collect()
    }

    /// Apply one operator action to one node.
    ///
    /// `in_flight` reports whether the node's execution guard is already held.
    pub fn apply(
        &mut self,
        node_id: &str,
        action: NodeAction,
        in_flight: bool,
    ) -> RolloutResult<NodeTransition> {
        self.ensure_open()?;
        let index = self.index_of(node_id)?;
        let from = self.record.nodes[index].status;
        let ctx = GuardContext {
            in_flight,
            sibling_deploying: self
                .record
                .nodes
                .iter()
                .enumerate()
                .any(|(i, n)| i != index && n.status == NodeStatus::Deploying),
        };

        let to = machine::transition(from, action, ctx).map_err(|rejection| match rejection {
            Rejection::NotAllowed => RolloutError::Validation(format!(
                "cannot {action} node {node_id} in state {from}"
            )),
            Rejection::InFlight => {
                RolloutError::Conflict(format!("node {node_id} already has an execution in flight"))
            }
            Rejection::SiblingDeploying => RolloutError::Validation(format!(
                "cannot roll back node {node_id} while another node is deploying"
            )),
        })?;

        let now = epoch_secs();
        self.set_status(index, to, log_line(now, action.as_str(), from, to), now);
        debug!(deployment = %self.record.id, node = %node_id, %from, %to, "node transition");
        Ok(NodeTransition {
            node_id: node_id.to_string(),
            from,
            to,
        })
    }

    /// Apply an execution callback to a `deploying` node.
    ///
    /// Callbacks are honored even after the deployment was closed, as long as
    /// the node itself is still `deploying`.
    pub fn complete(
        &mut self,
        node_id: &str,
        result: ExecutionStatus,
        output: &[String],
    ) -> RolloutResult<NodeTransition> {
        let index = self.index_of(node_id)?;
        let from = self.record.nodes[index].status;
        let to = machine::complete(from, result).map_err(|_| {
            RolloutError::Validation(format!(
                "node {node_id} is {from}, not deploying; execution result ignored"
            ))
        })?;

        let now = epoch_secs();
        self.record.nodes[index].log.extend(output.iter().cloned());
        self.set_status(index, to, log_line(now, "execution", from, to), now);
        Ok(NodeTransition {
            node_id: node_id.to_string(),
            from,
            to,
        })
    }

    /// Append free-text lines to a node's log without changing its status.
    pub fn append_log(&mut self, node_id: &str, lines: &[String]) -> RolloutResult<()> {
        let index = self.index_of(node_id)?;
        let now = epoch_secs();
        let node = &mut self.record.nodes[index];
        node.log.extend(lines.iter().cloned());
        node.updated_at = now;
        self.record.updated_at = now;
        Ok(())
    }

    /// Close the whole deployment as canceled.
    ///
    /// `pending` and `failed` nodes become `canceled`; `deploying` nodes are
    /// left for their callbacks.
    pub fn cancel(&mut self) -> RolloutResult<Vec<NodeTransition>> {
        self.ensure_open()?;
        let now = epoch_secs();
        let mut transitions = Vec::new();
        for index in 0..self.record.nodes.len() {
            let from = self.record.nodes[index].status;
            if matches!(from, NodeStatus::Pending | NodeStatus::Failed) {
                let to = NodeStatus::Canceled;
                self.set_status(index, to, log_line(now, "cancel deployment", from, to), now);
                transitions.push(self.transition_at(index, from));
            }
        }
        self.record.closure = Some(Closure::Canceled);
        self.refresh(now);
        Ok(transitions)
    }

    /// Close the whole deployment as rolled back.
    ///
    /// Rejected without effect while any node is `deploying`.
    pub fn rollback(&mut self) -> RolloutResult<Vec<NodeTransition>> {
        self.ensure_open()?;
        if let Some(busy) = self
            .record
            .nodes
            .iter()
            .find(|n| n.status == NodeStatus::Deploying)
        {
            return Err(RolloutError::Validation(format!(
                "cannot roll back deployment {} while node {} is deploying",
                self.record.id, busy.node.id
            )));
        }

        let now = epoch_secs();
        let mut transitions = Vec::new();
        for index in 0..self.record.nodes.len() {
            let from = self.record.nodes[index].status;
            let to = match from {
                NodeStatus::Success => NodeStatus::RolledBack,
                NodeStatus::Pending | NodeStatus::Failed => NodeStatus::Canceled,
                NodeStatus::Deploying
                | NodeStatus::Skipped
                | NodeStatus::RolledBack
                | NodeStatus::Canceled => continue,
            };
            self.set_status(index, to, log_line(now, "rollback deployment", from, to), now);
            transitions.push(self.transition_at(index, from));
        }
        self.record.closure = Some(Closure::RolledBack);
        self.refresh(now);
        Ok(transitions)
    }

    fn ensure_open(&self) -> RolloutResult<()> {
        if self.record.status.is_terminal() {
            return Err(RolloutError::Validation(format!(
                "deployment {} is {}",
                self.record.id, self.record.status
            )));
        }
        Ok(())
    }

    fn index_of(&self, node_id: &str) -> RolloutResult<usize> {
        self.record
            .nodes
            .iter()
            .position(|n| n.node.id == node_id)
            .ok_or_else(|| {
                RolloutError::NotFound(format!(
                    "node {node_id} in deployment {}",
                    self.record.id
                ))
            })
    }

    fn set_status(&mut self, index: usize, to: NodeStatus, line: String, now: u64) {
        let node = &mut self.record.nodes[index];
        node.status = to;
        node.log.push(line);
        node.updated_at = now;
        self.refresh(now);
    }

    fn transition_at(&self, index: usize, from: NodeStatus) -> NodeTransition {
        let node = &self.record.nodes[index];
        NodeTransition {
            node_id: node.node.id.clone(),
            from,
            to: node.status,
        }
    }

    fn derived(&self) -> DeploymentStatus {
        derive_status(
            self.record.nodes.iter().map(|n| n.status),
            self.record.closure,
        )
    }

    fn refresh(&mut self, now: u64) {
        self.record.status = self.derived();
        self.record.updated_at = now;
    }
}

fn log_line(at: u64, what: &str, from: NodeStatus, to: NodeStatus) -> String {
    format!("[{at}] {what}: {from} -> {to}")
}
