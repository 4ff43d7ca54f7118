//! Subsystem assembly and the rollout event loop.

use std::sync::Arc;

use grayline_core::{ExecutorKind, GraylineConfig, NotifierKind};
use grayline_health::{Evaluator, HealthMonitor, HealthReport, PrometheusClient};
use grayline_policy::{LogNotifier, Notifier, RollbackPolicyEngine, WebhookNotifier};
use grayline_rollout::{
    CommandExecutor, Coordinator, ExecutionPool, Executor, MockExecutor, RolloutEvent,
};
use grayline_state::{DeploymentStatus, StateStore};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Every long-lived subsystem of the daemon.
#[derive(Clone)]
pub struct Daemon {
    pub coordinator: Coordinator,
    pub monitor: HealthMonitor,
    pub engine: Arc<RollbackPolicyEngine>,
}

impl Daemon {
    pub async fn assemble(config: &GraylineConfig, store: StateStore) -> anyhow::Result<Self> {
        let executor: Arc<dyn Executor> = match config.executor.kind {
            ExecutorKind::Mock => {
                warn!("using mock executor, node actions always succeed");
                Arc::new(MockExecutor)
            }
            ExecutorKind::Command => {
                let program = config
                    .executor
                    .program
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("executor.program is not set"))?;
                info!(%program, "using command executor");
                Arc::new(CommandExecutor::new(program))
            }
        };
        let pool = ExecutionPool::new(
            executor,
            config.rollout.max_concurrent_executions,
            config.rollout.execution_timeout()?,
        );

        let coordinator = Coordinator::new(store.clone(), pool);
        let redispatched = coordinator.restore().await?;
        info!(redispatched, "coordinator ready");

        let notifier: Arc<dyn Notifier> = match config.notifier.kind {
            NotifierKind::Log => Arc::new(LogNotifier),
            NotifierKind::Webhook => {
                let url = config
                    .notifier
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("notifier.url is not set"))?;
                Arc::new(WebhookNotifier::new(url, config.notifier.timeout()?)?)
            }
        };
        let engine = Arc::new(RollbackPolicyEngine::new(coordinator.clone(), notifier));

        let evaluator = Evaluator::new(
            Arc::new(PrometheusClient::new(config.prometheus.address.clone())),
            config.health.query_timeout()?,
            config.health.window()?,
            config.health.step()?,
        );
        let callback_engine = Arc::clone(&engine);
        let monitor = HealthMonitor::new(store, evaluator, config.health.interval()?).with_callback(
            Arc::new(move |report: HealthReport| {
                let engine = Arc::clone(&callback_engine);
                Box::pin(async move {
                    let firings = engine.observe(&report).await;
                    if !firings.is_empty() {
                        debug!(app = %report.app, fired = firings.len(), "policy fired");
                    }
                }) as grayline_health::BoxFuture<'static, ()>
            }),
        );

        Ok(Self {
            coordinator,
            monitor,
            engine,
        })
    }

    /// Start monitoring every application with an open deployment, then
    /// follow rollout events until shutdown.
    pub async fn run_events(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.coordinator.subscribe();
        self.resume_monitors().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "rollout event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("rollout event loop stopped");
    }

    async fn resume_monitors(&self) {
        let apps = match self.coordinator.store().list_applications() {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "failed to list applications");
                return;
            }
        };
        for app in apps {
            if self.coordinator.active_deployment(&app.name).await.is_some() {
                self.monitor.start(&app.name).await;
            }
        }
    }

    pub async fn handle_event(&self, event: RolloutEvent) {
        match event {
            RolloutEvent::Created { app, status, .. } if status == DeploymentStatus::Deploying => {
                self.monitor.start(&app).await;
            }
            RolloutEvent::StatusChanged { app, to, .. } => {
                if to == DeploymentStatus::Deploying {
                    self.monitor.start(&app).await;
                } else if to.is_terminal() && self.coordinator.active_deployment(&app).await.is_none() {
                    self.monitor.stop(&app).await;
                    self.engine.forget(&app).await;
                }
            }
            RolloutEvent::Created { .. } | RolloutEvent::NodeTransition { .. } => {}
        }
    }
}
