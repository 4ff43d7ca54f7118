//! Health monitor — one periodic evaluation task per application.
//!
//! Each task re-reads the application record on every tick, so policy and
//! threshold edits take effect without a restart. A tick that is still
//! running when the next one is due causes that next tick to be skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use grayline_state::*;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::evaluator::{Evaluator, FiringRule, HealthReport};
use crate::query::BoxFuture;

/// Invoked with every completed report.
pub type ReportCallback = Arc<dyn Fn(HealthReport) -> BoxFuture<'static, ()> + Send + Sync>;

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Clears the tick-in-progress flag when the tick ends, however it ends.
struct TickFlag(Arc<AtomicBool>);

impl Drop for TickFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs periodic health evaluation for monitored applications.
#[derive(Clone)]
pub struct HealthMonitor {
    state: StateStore,
    evaluator: Arc<Evaluator>,
    interval: Duration,
    /// app name → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    on_report: Option<ReportCallback>,
}

impl HealthMonitor {
    pub fn new(state: StateStore, evaluator: Evaluator, interval: Duration) -> Self {
        Self {
            state,
            evaluator: Arc::new(evaluator),
            interval,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            on_report: None,
        }
    }

    pub fn with_callback(mut self, callback: ReportCallback) -> Self {
        self.on_report = Some(callback);
        self
    }

    /// Start monitoring `app`. A no-op if it is already monitored.
    pub async fn start(&self, app: &str) {
        let mut monitors = self.monitors.write().await;
        if monitors
            .get(app)
            .is_some_and(|slot| !slot.handle.is_finished())
        {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor_loop(
            app.to_string(),
            self.state.clone(),
            Arc::clone(&self.evaluator),
            self.interval,
            self.on_report.clone(),
            shutdown_rx,
        ));
        monitors.insert(app.to_string(), MonitorSlot { handle, shutdown_tx });
        info!(%app, interval = ?self.interval, "health monitor started");
    }

    pub async fn stop(&self, app: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(app) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%app, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (app, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%app, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn is_monitoring(&self, app: &str) -> bool {
        self.monitors.read().await.contains_key(app)
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.monitors.read().await.keys().cloned().collect();
        apps.sort();
        apps
    }

    /// Evaluate `app` once, outside the periodic loop.
    pub async fn evaluate_once(&self, app: &str) -> Option<HealthReport> {
        evaluate_app(app, &self.state, &self.evaluator).await
    }
}

async fn run_monitor_loop(
    app: String,
    state: StateStore,
    evaluator: Arc<Evaluator>,
    interval: Duration,
    callback: Option<ReportCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let in_progress = Arc::new(AtomicBool::new(false));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(%app, "health loop starting");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if in_progress.swap(true, Ordering::AcqRel) {
                    debug!(%app, "previous tick still running, skipping");
                    continue;
                }
                let flag = TickFlag(Arc::clone(&in_progress));
                let app = app.clone();
                let state = state.clone();
                let evaluator = Arc::clone(&evaluator);
                let callback = callback.clone();
                tokio::spawn(async move {
                    let _flag = flag;
                    if let Some(report) = evaluate_app(&app, &state, &evaluator).await
                        && let Some(cb) = callback
                    {
                        cb(report).await;
                    }
                });
            }
            _ = shutdown.changed() => {
                debug!(%app, "health loop shutting down");
                break;
            }
        }
    }
}

/// Evaluate the current RED config and firing rules of `app`.
///
/// Returns `None` when the application is gone or has nothing to evaluate.
async fn evaluate_app(app: &str, state: &StateStore, evaluator: &Evaluator) -> Option<HealthReport> {
    let application = match state.get_application(app) {
        Ok(Some(application)) => application,
        Ok(None) => {
            debug!(%app, "application not found, nothing to evaluate");
            return None;
        }
        Err(e) => {
            error!(%app, error = %e, "failed to load application");
            return None;
        }
    };

    let red = application.red_metrics.as_ref().filter(|r| r.enabled);
    let rules = firing_rules(&application);
    if red.is_none() && rules.is_empty() {
        return None;
    }
    Some(evaluator.evaluate(app, red, &rules, epoch_secs()).await)
}

/// Unbound rules of an enabled policy, evaluated as firing expressions.
pub fn firing_rules(application: &Application) -> Vec<FiringRule> {
    application
        .rollback_policy
        .iter()
        .filter(|p| p.enabled)
        .flat_map(|p| p.alert_rules.iter())
        .filter(|rule| rule.metric.is_none() && !rule.expr.trim().is_empty())
        .map(|rule| FiringRule {
            name: rule.name.clone(),
            expr: rule.expr.clone(),
            labels: rule.labels.clone(),
        })
        .collect()
}
