//! Prometheus text exposition of rollout state.
//!
//! Info gauges mark nodes that are deploying and nodes that were rolled back
//! in their application's newest deployment. A per-status deployment count
//! sits alongside them.

use std::collections::HashMap;
use std::fmt::Write;

use grayline_state::{DeploymentRecord, DeploymentStatus, NodeRecord, NodeStatus};

const STATUSES: [DeploymentStatus; 6] = [
    DeploymentStatus::Pending,
    DeploymentStatus::Deploying,
    DeploymentStatus::Success,
    DeploymentStatus::Failed,
    DeploymentStatus::RolledBack,
    DeploymentStatus::Canceled,
];

/// Render deployment records into Prometheus text format.
pub fn render_prometheus(records: &[DeploymentRecord]) -> String {
    let mut ordered: Vec<&DeploymentRecord> = records.iter().collect();
    ordered.sort_by(|a, b| (&a.app, a.created_at, &a.id).cmp(&(&b.app, b.created_at, &b.id)));

    let mut out = String::new();

    out.push_str("# HELP grayline_node_deploying_info Node with an execution in progress.\n");
    out.push_str("# TYPE grayline_node_deploying_info gauge\n");
    for record in &ordered {
        for node in record.nodes.iter().filter(|n| n.status == NodeStatus::Deploying) {
            let _ = writeln!(
                out,
                "grayline_node_deploying_info{{{}}} 1",
                node_labels(record, node)
            );
        }
    }

    // Only the newest deployment per app describes what is running now.
    let mut newest: HashMap<&str, &DeploymentRecord> = HashMap::new();
    for &record in &ordered {
        newest.insert(record.app.as_str(), record);
    }
    let mut current: Vec<&DeploymentRecord> = newest.into_values().collect();
    current.sort_by(|a, b| a.app.cmp(&b.app));

    out.push_str(
        "# HELP grayline_node_rolled_back_info Node rolled back in its application's newest deployment.\n",
    );
    out.push_str("# TYPE grayline_node_rolled_back_info gauge\n");
    for record in current {
        for node in record.nodes.iter().filter(|n| n.status == NodeStatus::RolledBack) {
            let restored = node.previous_version.as_deref().unwrap_or("");
            let _ = writeln!(
                out,
                "grayline_node_rolled_back_info{{{},restored_version=\"{}\"}} 1",
                node_labels(record, node),
                escape(restored)
            );
        }
    }

    out.push_str("# HELP grayline_deployments Deployments by status.\n");
    out.push_str("# TYPE grayline_deployments gauge\n");
    for status in STATUSES {
        let count = records.iter().filter(|r| r.status == status).count();
        let _ = writeln!(out, "grayline_deployments{{status=\"{status}\"}} {count}");
    }

    out
}

fn node_labels(record: &DeploymentRecord, node: &NodeRecord) -> String {
    format!(
        "node=\"{}\",host=\"{}\",app=\"{}\",version=\"{}\",deployment=\"{}\"",
        escape(&node.node.id),
        escape(&node.node.address),
        escape(&record.app),
        escape(&record.version),
        escape(&record.id)
    )
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
