//! Domain types for the Grayline state store.
//!
//! These types are the persisted shape of deployments, application records,
//! and diagnostic reports. Lifecycle rules live in `grayline-rollout`; this
//! module only describes the data.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a target node.
pub type NodeId = String;

// ── Nodes ─────────────────────────────────────────────────────────

/// A target node as known to the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRef {
    pub id: NodeId,
    /// Host name or IP the execution channel connects to.
    pub address: String,
}

/// Per-node deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Deploying,
    Success,
    Failed,
    Skipped,
    RolledBack,
    Canceled,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 7] = [
        NodeStatus::Pending,
        NodeStatus::Deploying,
        NodeStatus::Success,
        NodeStatus::Failed,
        NodeStatus::Skipped,
        NodeStatus::RolledBack,
        NodeStatus::Canceled,
    ];

    /// `rolled_back` and `canceled` accept no further actions.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::RolledBack | NodeStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Deploying => "deploying",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::RolledBack => "rolled_back",
            NodeStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one node within a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node: NodeRef,
    pub status: NodeStatus,
    /// Version the node ran before this deployment; a rollback restores it.
    #[serde(default)]
    pub previous_version: Option<String>,
    /// Execution log lines, oldest first.
    pub log: Vec<String>,
    pub updated_at: u64,
}

// ── Deployments ───────────────────────────────────────────────────

/// Deployment-level status, derived from node statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Success,
    Failed,
    RolledBack,
    Canceled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::RolledBack | DeploymentStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-issued whole-deployment closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Closure {
    Canceled,
    RolledBack,
}

/// Persisted deployment: one package version rolled out to an app's nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub app: String,
    pub version: String,
    pub gray_node: Option<NodeId>,
    pub nodes: Vec<NodeRecord>,
    /// Cached aggregate; always re-derivable from `nodes` and `closure`.
    pub status: DeploymentStatus,
    pub closure: Option<Closure>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DeploymentRecord {
    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node.id == node_id)
    }
}

/// Filter and paging for deployment listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentFilter {
    pub app: Option<String>,
    pub status: Option<DeploymentStatus>,
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
}

impl DeploymentFilter {
    pub const DEFAULT_PAGE_SIZE: usize = 20;
    pub const MAX_PAGE_SIZE: usize = 200;

    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        self.app.as_deref().is_none_or(|app| record.app == app)
            && self.status.is_none_or(|status| record.status == status)
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

// ── Applications ──────────────────────────────────────────────────

/// Inventory record for an application. Managed outside the core; the
/// rollout and policy layers only read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub name: String,
    pub nodes: Vec<NodeRef>,
    #[serde(default)]
    pub rollback_policy: Option<RollbackPolicy>,
    #[serde(default)]
    pub red_metrics: Option<RedMetricsConfig>,
    #[serde(default)]
    pub updated_at: u64,
}

/// Automatic rollback policy attached to an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollbackPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub alert_rules: Vec<AlertRule>,
    pub auto_rollback: bool,
    #[serde(default)]
    pub notify_channel: String,
}

/// A rule whose sustained breach fires the policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub name: String,
    /// Metric expression. For unbound rules this is evaluated directly.
    #[serde(default)]
    pub expr: String,
    /// Sustained-breach window, e.g. "5m".
    pub duration: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Track a RED metric classification instead of `expr`.
    #[serde(default)]
    pub metric: Option<MetricKind>,
}

/// The three RED signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Rate,
    Error,
    Duration,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Rate, MetricKind::Error, MetricKind::Duration];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Rate => "rate",
            MetricKind::Error => "error",
            MetricKind::Duration => "duration",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RED metrics monitoring for an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RedMetricsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub rate: Option<MetricDefinition>,
    #[serde(default)]
    pub error: Option<MetricDefinition>,
    #[serde(default)]
    pub duration: Option<MetricDefinition>,
    #[serde(default)]
    pub threshold: HealthThreshold,
}

impl RedMetricsConfig {
    pub fn definition(&self, kind: MetricKind) -> Option<&MetricDefinition> {
        match kind {
            MetricKind::Rate => self.rate.as_ref(),
            MetricKind::Error => self.error.as_ref(),
            MetricKind::Duration => self.duration.as_ref(),
        }
    }

    /// Configured definitions in rate, error, duration order.
    pub fn definitions(&self) -> impl Iterator<Item = (MetricKind, &MetricDefinition)> {
        MetricKind::ALL
            .into_iter()
            .filter_map(|kind| self.definition(kind).map(|def| (kind, def)))
    }
}

/// A single metric query with descriptive metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricDefinition {
    #[serde(default)]
    pub metric_name: String,
    pub query: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
}

/// Bounds that separate healthy from unhealthy RED values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthThreshold {
    /// Minimum request rate (req/s).
    pub rate_min: f64,
    /// Maximum error rate (%).
    pub error_rate_max: f64,
    /// P95 latency ceiling (ms).
    pub duration_p95_max: f64,
    /// P99 latency ceiling (ms), used when the duration query is a p99.
    #[serde(default)]
    pub duration_p99_max: Option<f64>,
}

/// Health classification for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

// ── Diagnostic reports ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Generating,
    Completed,
    Failed,
}

/// A diagnostic report produced by an external generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub deployment_id: DeploymentId,
    pub status: ReportStatus,
    #[serde(default)]
    pub content: String,
    /// Metric expressions the producer evaluated.
    #[serde(default)]
    pub expressions: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
