//! Rollback policy engine.
//!
//! Consumes health reports, tracks each rule's breach window, and when a
//! breach becomes sustained sends one notification and (if enabled) issues
//! one batch rollback on the application's active deployment.

use std::collections::HashMap;
use std::sync::Arc;

use grayline_health::HealthReport;
use grayline_rollout::{Coordinator, NodeAction, NodeOutcome, NodeResult};
use grayline_state::*;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::notify::{AlertNotification, Notifier};
use crate::rules::{CompiledRule, PolicyError, compile};
use crate::tracker::BreachTracker;

/// Outcome of one sustained breach.
#[derive(Debug, Clone)]
pub struct Firing {
    pub rule: String,
    pub notification: AlertNotification,
    /// Per-node results of the automatic rollback, when one was issued.
    pub rollback: Option<Vec<NodeResult>>,
}

pub struct RollbackPolicyEngine {
    coordinator: Coordinator,
    notifier: Arc<dyn Notifier>,
    /// app → rule name → tracker.
    trackers: Mutex<HashMap<String, HashMap<String, BreachTracker>>>,
}

impl RollbackPolicyEngine {
    pub fn new(coordinator: Coordinator, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            coordinator,
            notifier,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a policy before it is stored. Invalid rules stay inactive.
    pub fn validate(policy: &RollbackPolicy) -> Vec<PolicyError> {
        crate::rules::validate(policy)
    }

    /// Feed one health report. Returns every rule that fired on it.
    pub async fn observe(&self, report: &HealthReport) -> Vec<Firing> {
        let app = report.app.as_str();
        let application = match self.coordinator.store().get_application(app) {
            Ok(Some(application)) => application,
            Ok(None) => {
                debug!(%app, "report for unknown application ignored");
                return Vec::new();
            }
            Err(e) => {
                error!(%app, error = %e, "failed to load application");
                return Vec::new();
            }
        };
        let Some(policy) = application.rollback_policy.as_ref().filter(|p| p.enabled) else {
            self.forget(app).await;
            return Vec::new();
        };

        let compiled = compile(policy);
        for err in &compiled.errors {
            warn!(%app, rule = %err.rule, reason = %err.reason, "alert rule inactive");
        }

        let mut due = Vec::new();
        {
            let mut all = self.trackers.lock().await;
            let trackers = all.entry(app.to_string()).or_default();
            trackers.retain(|name, _| compiled.rules.iter().any(|r| &r.name == name));

            for rule in &compiled.rules {
                let Some(evaluation) = report.get(&rule.signal) else {
                    continue;
                };
                let tracker = trackers.entry(rule.name.clone()).or_default();
                let was_breaching = tracker.breach_start.is_some();
                if tracker.observe(evaluation.classification, evaluation.sampled_at, rule.window) {
                    due.push((rule.clone(), evaluation.clone(), tracker.breach_secs(evaluation.sampled_at)));
                } else if !was_breaching && tracker.breach_start.is_some() {
                    info!(%app, rule = %rule.name, window = ?rule.window, "breach started");
                } else if was_breaching && tracker.breach_start.is_none() {
                    info!(%app, rule = %rule.name, "breach cleared");
                }
            }
        }

        let mut firings = Vec::with_capacity(due.len());
        for (rule, evaluation, breach_secs) in due {
            firings.push(
                self.fire(
                    app,
                    &compiled.notify_channel,
                    compiled.auto_rollback,
                    &rule,
                    evaluation.value,
                    evaluation.threshold,
                    breach_secs,
                )
                .await,
            );
        }
        firings
    }

    /// Drop all breach state for `app`.
    pub async fn forget(&self, app: &str) {
        self.trackers.lock().await.remove(app);
    }

    pub async fn tracker(&self, app: &str, rule: &str) -> Option<BreachTracker> {
        self.trackers
            .lock()
            .await
            .get(app)
            .and_then(|rules| rules.get(rule))
            .copied()
    }

    #[allow(clippy::too_many_arguments)]
    async fn fire(
        &self,
        app: &str,
        channel: &str,
        auto_rollback: bool,
        rule: &CompiledRule,
        value: Option<f64>,
        threshold: f64,
        breach_secs: u64,
    ) -> Firing {
        let active = self.coordinator.active_deployment(app).await;
        warn!(
            %app,
            rule = %rule.name,
            severity = %rule.severity,
            breach_secs,
            deployment = ?active.as_ref().map(|d| &d.id),
            "sustained breach"
        );

        let mut rollback = None;
        let mut rollback_note = None;
        if auto_rollback {
            match &active {
                Some(deployment) => {
                    let scope = rollback_scope(deployment);
                    match self
                        .coordinator
                        .apply(&deployment.id, NodeAction::Rollback, &scope)
                        .await
                    {
                        Ok(results) => {
                            let applied = results.iter().filter(|r| r.is_applied()).count();
                            if applied == 0 {
                                let reason = first_rejection(&results)
                                    .unwrap_or_else(|| "no node eligible".to_string());
                                warn!(
                                    %app,
                                    deployment = %deployment.id,
                                    requested = scope.len(),
                                    %reason,
                                    "automatic rollback blocked"
                                );
                                rollback_note = Some(format!("rollback blocked: {reason}"));
                            } else {
                                info!(
                                    %app,
                                    deployment = %deployment.id,
                                    requested = scope.len(),
                                    applied,
                                    "automatic rollback issued"
                                );
                                rollback_note =
                                    Some(format!("rolled back {applied} of {} nodes", scope.len()));
                            }
                            rollback = Some(results);
                        }
                        Err(e) => {
                            error!(%app, deployment = %deployment.id, error = %e, "automatic rollback failed");
                            rollback_note = Some(format!("rollback failed: {e}"));
                        }
                    }
                }
                None => {
                    warn!(%app, rule = %rule.name, "no active deployment to roll back");
                    rollback_note = Some("rollback skipped: no active deployment".to_string());
                }
            }
        }
        let rolled_back = rollback
            .as_ref()
            .is_some_and(|results| results.iter().any(NodeResult::is_applied));

        let notification = AlertNotification {
            app: app.to_string(),
            rule: rule.name.clone(),
            severity: rule.severity.clone(),
            deployment_id: active.as_ref().map(|d| d.id.clone()),
            breach_secs,
            value,
            threshold,
            description: rule.description.clone(),
            nodes: active.as_ref().map(started_nodes).unwrap_or_default(),
            auto_rollback: rolled_back,
            rollback_note,
            fired_at: epoch_secs(),
        };

        let notifier = Arc::clone(&self.notifier);
        let channel = channel.to_string();
        let payload = notification.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&channel, &payload).await {
                warn!(%channel, app = %payload.app, rule = %payload.rule, error = %e, "notification failed");
            }
        });

        Firing {
            rule: rule.name.clone(),
            notification,
            rollback,
        }
    }
}

/// Nodes an automatic rollback targets: everything not already closed.
pub fn rollback_scope(deployment: &DeploymentRecord) -> Vec<NodeId> {
    deployment
        .nodes
        .iter()
        .filter(|n| !n.status.is_terminal())
        .map(|n| n.node.id.clone())
        .collect()
}

fn first_rejection(results: &[NodeResult]) -> Option<String> {
    results.iter().find_map(|r| match &r.outcome {
        NodeOutcome::Rejected { message, .. } => Some(format!("node {}: {message}", r.node_id)),
        NodeOutcome::Applied { .. } => None,
    })
}

fn started_nodes(deployment: &DeploymentRecord) -> Vec<NodeId> {
    deployment
        .nodes
        .iter()
        .filter(|n| n.status != NodeStatus::Pending)
        .map(|n| n.node.id.clone())
        .collect()
}
