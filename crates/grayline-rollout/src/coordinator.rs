//! Batch operation coordinator.
//!
//! Owns the live deployments, applies operator and policy actions to sets
//! of nodes, persists the result once per call, and dispatches remote
//! executions through the bounded [`ExecutionPool`].
//!
//! Each deployment sits behind its own async mutex, so node transitions and
//! the aggregate recomputation are serialized per deployment while separate
//! deployments never contend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use grayline_state::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, error, info, warn};

use crate::deployment::{Deployment, NodeTransition, installed_versions};
use crate::error::{ErrorKind, RolloutError, RolloutResult};
use crate::executor::{ExecutionOutcome, ExecutionPool, ExecutionRequest};
use crate::guard::{NodeGuard, NodeGuards};
use crate::machine::NodeAction;

const EVENT_CAPACITY: usize = 256;

/// Per-node result of a batch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NodeOutcome {
    Applied { from: NodeStatus, to: NodeStatus },
    Rejected { error: ErrorKind, message: String },
}

impl NodeResult {
    fn applied(t: &NodeTransition) -> Self {
        Self {
            node_id: t.node_id.clone(),
            outcome: NodeOutcome::Applied {
                from: t.from,
                to: t.to,
            },
        }
    }

    fn rejected(node_id: &str, err: &RolloutError) -> Self {
        Self {
            node_id: node_id.to_string(),
            outcome: NodeOutcome::Rejected {
                error: err.kind(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Applied { .. })
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match &self.outcome {
            NodeOutcome::Applied { .. } => None,
            NodeOutcome::Rejected { error, .. } => Some(*error),
        }
    }
}

/// Change notifications for subscribers such as the health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    Created {
        deployment_id: DeploymentId,
        app: String,
        status: DeploymentStatus,
    },
    NodeTransition {
        deployment_id: DeploymentId,
        app: String,
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
    StatusChanged {
        deployment_id: DeploymentId,
        app: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
}

type Handle = Arc<Mutex<Deployment>>;

struct Inner {
    store: StateStore,
    deployments: RwLock<HashMap<DeploymentId, Handle>>,
    guards: NodeGuards,
    pool: ExecutionPool,
    events: broadcast::Sender<RolloutEvent>,
}

/// Cheaply cloneable handle to the rollout core.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(store: StateStore, pool: ExecutionPool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                deployments: RwLock::new(HashMap::new()),
                guards: NodeGuards::new(),
                pool,
                events,
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.inner.events.subscribe()
    }

    /// Load persisted deployments and re-dispatch nodes left `deploying`.
    ///
    /// Returns the number of re-dispatched executions.
    pub async fn restore(&self) -> RolloutResult<usize> {
        let records = self.inner.store.list_deployments()?;
        let mut redispatched = 0;
        let mut map = self.inner.deployments.write().await;

        for record in records {
            let deployment = Deployment::restore(record);
            for node in deployment.deploying_nodes() {
                let Some(guard) = self.inner.guards.try_acquire(deployment.id(), &node.id) else {
                    continue;
                };
                self.dispatch(deployment.record(), node, NodeAction::Deploy, Some(guard));
                redispatched += 1;
            }
            map.insert(
                deployment.id().to_string(),
                Arc::new(Mutex::new(deployment)),
            );
        }

        info!(deployments = map.len(), redispatched, "rollout state restored");
        Ok(redispatched)
    }

    /// Create a deployment of `version` for every node of `app`.
    pub async fn create(
        &self,
        app: &str,
        version: &str,
        gray_node: Option<&str>,
    ) -> RolloutResult<DeploymentRecord> {
        let application = self
            .inner
            .store
            .get_application(app)?
            .ok_or_else(|| RolloutError::NotFound(format!("application {app}")))?;

        let installed = installed_versions(&self.app_records(app).await);
        let deployment =
            Deployment::create(&application, version, gray_node)?.with_previous_versions(&installed);
        self.inner.store.put_deployment(deployment.record())?;

        let record = deployment.record().clone();
        let gray = deployment
            .deploying_nodes()
            .into_iter()
            .filter_map(|node| {
                self.inner
                    .guards
                    .try_acquire(&record.id, &node.id)
                    .map(|guard| (node, guard))
            })
            .collect::<Vec<_>>();

        self.inner
            .deployments
            .write()
            .await
            .insert(record.id.clone(), Arc::new(Mutex::new(deployment)));

        info!(
            deployment = %record.id,
            app = %record.app,
            version = %record.version,
            gray_node = ?record.gray_node,
            nodes = record.nodes.len(),
            "deployment created"
        );
        let _ = self.inner.events.send(RolloutEvent::Created {
            deployment_id: record.id.clone(),
            app: record.app.clone(),
            status: record.status,
        });

        for (node, guard) in gray {
            self.dispatch(&record, node, NodeAction::Deploy, Some(guard));
        }
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> RolloutResult<DeploymentRecord> {
        let handle = self.handle(id).await?;
        let deployment = handle.lock().await;
        Ok(deployment.record().clone())
    }

    pub fn list(&self, filter: &DeploymentFilter) -> RolloutResult<Page<DeploymentRecord>> {
        Ok(self.inner.store.search_deployments(filter)?)
    }

    /// Newest non-terminal deployment of `app`, if any.
    pub async fn active_deployment(&self, app: &str) -> Option<DeploymentRecord> {
        self.app_records(app)
            .await
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
    }

    /// Snapshot of every live deployment.
    pub async fn snapshot(&self) -> Vec<DeploymentRecord> {
        let handles: Vec<Handle> = self
            .inner
            .deployments
            .read()
            .await
            .values()
            .cloned()
            .collect();

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.lock().await.record().clone());
        }
        records
    }

    async fn app_records(&self, app: &str) -> Vec<DeploymentRecord> {
        let mut records = self.snapshot().await;
        records.retain(|record| record.app == app);
        records
    }

    /// Apply `action` to each of `node_ids`, in order.
    ///
    /// Per-node failures are reported in the result and never abort the
    /// batch. The call itself fails only when the deployment is unknown or
    /// the state store rejects the write.
    pub async fn apply(
        &self,
        id: &str,
        action: NodeAction,
        node_ids: &[NodeId],
    ) -> RolloutResult<Vec<NodeResult>> {
        let handle = self.handle(id).await?;
        let mut current = handle.lock().await;
        let mut next = current.clone();
        let before = next.status();

        let rollback_blocked = action == NodeAction::Rollback && next.any_deploying();
        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(node_ids.len());
        let mut transitions = Vec::new();
        let mut dispatches: Vec<(NodeRef, Option<NodeGuard>)> = Vec::new();

        for node_id in node_ids {
            if !seen.insert(node_id.as_str()) {
                let err = RolloutError::Validation(format!("node {node_id} listed more than once"));
                results.push(NodeResult::rejected(node_id, &err));
                continue;
            }
            if rollback_blocked {
                let err = RolloutError::Validation(format!(
                    "cannot roll back node {node_id} while deployment {id} has a node deploying"
                ));
                results.push(NodeResult::rejected(node_id, &err));
                continue;
            }

            let guard = if action.starts_execution() {
                self.inner.guards.try_acquire(id, node_id)
            } else {
                None
            };
            let in_flight = action.starts_execution() && guard.is_none();

            match next.apply(node_id, action, in_flight) {
                Ok(transition) => {
                    results.push(NodeResult::applied(&transition));
                    if matches!(action, NodeAction::Deploy | NodeAction::Retry | NodeAction::Rollback)
                        && let Some(node) = next.node(node_id)
                    {
                        dispatches.push((node.node.clone(), guard));
                    }
                    transitions.push(transition);
                }
                Err(err) => {
                    debug!(deployment = %id, node = %node_id, %action, error = %err, "node action rejected");
                    results.push(NodeResult::rejected(node_id, &err));
                }
            }
        }

        if !transitions.is_empty() {
            self.inner.store.put_deployment(next.record())?;
            *current = next;
        }
        let record = current.record().clone();
        drop(current);

        let applied = transitions.len();
        info!(
            deployment = %id,
            %action,
            requested = node_ids.len(),
            applied,
            rejected = node_ids.len() - applied,
            "batch applied"
        );
        self.publish(&record, &transitions, before);

        for (node, guard) in dispatches {
            self.dispatch(&record, node, action, guard);
        }
        Ok(results)
    }

    /// Cancel the whole deployment. In-flight executions run to completion.
    pub async fn cancel(&self, id: &str) -> RolloutResult<DeploymentRecord> {
        self.close(id, Deployment::cancel).await
    }

    /// Roll back the whole deployment.
    pub async fn rollback(&self, id: &str) -> RolloutResult<DeploymentRecord> {
        self.close(id, Deployment::rollback).await
    }

    /// Diagnostic report written for a deployment by the external generator.
    pub async fn report(&self, id: &str) -> RolloutResult<DiagnosticReport> {
        self.handle(id).await?;
        self.inner
            .store
            .get_report(id)?
            .ok_or_else(|| RolloutError::NotFound(format!("report for deployment {id}")))
    }

    async fn close(
        &self,
        id: &str,
        op: fn(&mut Deployment) -> RolloutResult<Vec<NodeTransition>>,
    ) -> RolloutResult<DeploymentRecord> {
        let handle = self.handle(id).await?;
        let mut current = handle.lock().await;
        let mut next = current.clone();
        let before = next.status();

        let transitions = op(&mut next)?;
        self.inner.store.put_deployment(next.record())?;
        *current = next;
        let record = current.record().clone();
        drop(current);

        info!(deployment = %id, status = %record.status, nodes = transitions.len(), "deployment closed");
        self.publish(&record, &transitions, before);
        Ok(record)
    }

    async fn handle(&self, id: &str) -> RolloutResult<Handle> {
        self.inner
            .deployments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RolloutError::NotFound(format!("deployment {id}")))
    }

    fn dispatch(
        &self,
        record: &DeploymentRecord,
        node: NodeRef,
        action: NodeAction,
        guard: Option<NodeGuard>,
    ) {
        let request = ExecutionRequest {
            deployment_id: record.id.clone(),
            app: record.app.clone(),
            version: record.version.clone(),
            previous_version: record
                .node(&node.id)
                .and_then(|n| n.previous_version.clone()),
            node,
            action,
        };
        let coordinator = self.clone();

        tokio::spawn(async move {
            let deployment_id = request.deployment_id.clone();
            let node_id = request.node.id.clone();
            let outcome = coordinator.inner.pool.run(request).await;

            if action.starts_execution() {
                coordinator.finish_execution(&deployment_id, &node_id, outcome).await;
            } else {
                coordinator.record_output(&deployment_id, &node_id, action, outcome).await;
            }
            // Released only after the callback has been applied.
            drop(guard);
        });
    }

    /// Feed an execution result back as the `deploying -> success|failed` callback.
    async fn finish_execution(&self, id: &str, node_id: &str, outcome: ExecutionOutcome) {
        let Ok(handle) = self.handle(id).await else {
            warn!(deployment = %id, node = %node_id, "execution finished for unknown deployment");
            return;
        };
        let mut deployment = handle.lock().await;
        let before = deployment.status();

        let transition = match deployment.complete(node_id, outcome.status, &outcome.log) {
            Ok(t) => t,
            Err(err) => {
                warn!(deployment = %id, node = %node_id, error = %err, "late execution result ignored");
                return;
            }
        };
        if let Err(err) = self.inner.store.put_deployment(deployment.record()) {
            error!(deployment = %id, node = %node_id, error = %err, "failed to persist execution result");
        }
        let record = deployment.record().clone();
        drop(deployment);

        info!(deployment = %id, node = %node_id, status = %transition.to, "execution finished");
        self.publish(&record, std::slice::from_ref(&transition), before);
    }

    /// Remote rollback outcomes only land in the node log.
    async fn record_output(
        &self,
        id: &str,
        node_id: &str,
        action: NodeAction,
        outcome: ExecutionOutcome,
    ) {
        let Ok(handle) = self.handle(id).await else {
            return;
        };
        let mut deployment = handle.lock().await;
        let mut lines = outcome.log;
        lines.push(format!(
            "[{}] remote {action}: {:?}",
            epoch_secs(),
            outcome.status
        ));
        if let Err(err) = deployment.append_log(node_id, &lines) {
            warn!(deployment = %id, node = %node_id, error = %err, "dropping remote output");
            return;
        }
        if let Err(err) = self.inner.store.put_deployment(deployment.record()) {
            error!(deployment = %id, node = %node_id, error = %err, "failed to persist node log");
        }
    }

    fn publish(
        &self,
        record: &DeploymentRecord,
        transitions: &[NodeTransition],
        before: DeploymentStatus,
    ) {
        // Send errors only mean nobody is subscribed.
        for t in transitions {
            let _ = self.inner.events.send(RolloutEvent::NodeTransition {
                deployment_id: record.id.clone(),
                app: record.app.clone(),
                node_id: t.node_id.clone(),
                from: t.from,
                to: t.to,
            });
        }
        if record.status != before {
            debug!(deployment = %record.id, from = %before, to = %record.status, "deployment status changed");
            let _ = self.inner.events.send(RolloutEvent::StatusChanged {
                deployment_id: record.id.clone(),
                app: record.app.clone(),
                from: before,
                to: record.status,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BoxFuture, ExecutionError, Executor};
    use crate::machine::ExecutionStatus;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Per-node scripted outcomes, optionally held until a gate opens.
    #[derive(Default)]
    struct Scripted {
        outcomes: std::sync::Mutex<HashMap<String, VecDeque<ExecutionStatus>>>,
        gates: std::sync::Mutex<HashMap<String, Arc<Notify>>>,
        calls: std::sync::Mutex<Vec<(String, NodeAction)>>,
        previous: std::sync::Mutex<Vec<(String, NodeAction, Option<String>)>>,
    }

    impl Scripted {
        fn script(&self, node: &str, outcomes: &[ExecutionStatus]) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(node.to_string(), outcomes.iter().copied().collect());
        }

        fn gate(&self, node: &str) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            self.gates
                .lock()
                .unwrap()
                .insert(node.to_string(), notify.clone());
            notify
        }

        fn calls(&self) -> Vec<(String, NodeAction)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Executor for Scripted {
        fn execute(
            &self,
            request: ExecutionRequest,
        ) -> BoxFuture<'_, Result<ExecutionOutcome, ExecutionError>> {
            Box::pin(async move {
                let node = request.node.id.clone();
                self.calls.lock().unwrap().push((node.clone(), request.action));
                self.previous.lock().unwrap().push((
                    node.clone(),
                    request.action,
                    request.previous_version.clone(),
                ));
                let gate = self.gates.lock().unwrap().get(&node).cloned();
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                let status = self
                    .outcomes
                    .lock()
                    .unwrap()
                    .get_mut(&node)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(ExecutionStatus::Success);
                Ok(ExecutionOutcome {
                    status,
                    log: vec![format!("{} on {node}", request.action)],
                })
            })
        }
    }

    fn setup(nodes: &[&str]) -> (Coordinator, Arc<Scripted>) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_application(&Application {
                name: "billing".into(),
                nodes: nodes
                    .iter()
                    .enumerate()
                    .map(|(i, id)| NodeRef {
                        id: id.to_string(),
                        address: format!("10.0.0.{}", i + 1),
                    })
                    .collect(),
                rollback_policy: None,
                red_metrics: None,
                updated_at: 0,
            })
            .unwrap();
        let executor = Arc::new(Scripted::default());
        let pool = ExecutionPool::new(executor.clone(), 4, Duration::from_secs(5));
        (Coordinator::new(store, pool), executor)
    }

    fn ids(nodes: &[&str]) -> Vec<NodeId> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    async fn wait_node(c: &Coordinator, id: &str, node: &str, status: NodeStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = c.get(id).await.unwrap();
            if record.node(node).map(|n| n.status) == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "node {node} never reached {status}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn gray_node_is_dispatched_on_create() {
        let (c, executor) = setup(&["a", "b", "c"]);
        let record = c.create("billing", "1.4.0", Some("b")).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Deploying);
        assert_eq!(record.node("b").unwrap().status, NodeStatus::Deploying);
        assert_eq!(record.node("a").unwrap().status, NodeStatus::Pending);

        wait_node(&c, &record.id, "b", NodeStatus::Success).await;
        assert_eq!(executor.calls(), vec![("b".to_string(), NodeAction::Deploy)]);

        let stored = c.store().get_deployment(&record.id).unwrap().unwrap();
        assert_eq!(stored.node("b").unwrap().status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn create_unknown_app_is_not_found() {
        let (c, _) = setup(&["a"]);
        assert!(matches!(
            c.create("ledger", "1.0", None).await,
            Err(RolloutError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deploy_batch_with_in_flight_node() {
        let (c, executor) = setup(&["a", "b", "c"]);
        let gate = executor.gate("b");
        let record = c.create("billing", "1.4.0", Some("b")).await.unwrap();

        let results = c
            .apply(&record.id, NodeAction::Deploy, &ids(&["a", "b", "c"]))
            .await
            .unwrap();
        assert!(results[0].is_applied());
        assert_eq!(results[1].error(), Some(ErrorKind::Conflict));
        assert!(results[2].is_applied());

        gate.notify_one();
        for node in ["a", "b", "c"] {
            wait_node(&c, &record.id, node, NodeStatus::Success).await;
        }
        assert_eq!(c.get(&record.id).await.unwrap().status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn retry_then_rollback() {
        let (c, executor) = setup(&["a", "b"]);
        executor.script("a", &[ExecutionStatus::Failed, ExecutionStatus::Success]);
        let record = c.create("billing", "2.0.0", Some("a")).await.unwrap();
        wait_node(&c, &record.id, "a", NodeStatus::Failed).await;
        assert_eq!(c.get(&record.id).await.unwrap().status, DeploymentStatus::Failed);

        let results = c.apply(&record.id, NodeAction::Retry, &ids(&["a"])).await.unwrap();
        assert!(results[0].is_applied());
        wait_node(&c, &record.id, "a", NodeStatus::Success).await;

        let results = c
            .apply(&record.id, NodeAction::Rollback, &ids(&["a"]))
            .await
            .unwrap();
        assert_eq!(
            results[0].outcome,
            NodeOutcome::Applied {
                from: NodeStatus::Success,
                to: NodeStatus::RolledBack
            }
        );

        // The remote rollback runs in the background and only touches the log.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !executor.calls().contains(&("a".to_string(), NodeAction::Rollback)) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let record = c.get(&record.id).await.unwrap();
        assert_eq!(record.node("a").unwrap().status, NodeStatus::RolledBack);
    }

    #[tokio::test]
    async fn rollback_restores_version_from_earlier_deployment() {
        let (c, executor) = setup(&["a", "b"]);
        let first = c.create("billing", "1.0.0", Some("a")).await.unwrap();
        wait_node(&c, &first.id, "a", NodeStatus::Success).await;
        c.cancel(&first.id).await.unwrap();

        let second = c.create("billing", "2.0.0", Some("a")).await.unwrap();
        assert_eq!(second.node("a").unwrap().previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(second.node("b").unwrap().previous_version, None);
        wait_node(&c, &second.id, "a", NodeStatus::Success).await;

        c.apply(&second.id, NodeAction::Rollback, &ids(&["a"])).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let calls = executor.previous.lock().unwrap().clone();
            if let Some((_, _, previous)) = calls
                .iter()
                .find(|(node, action, _)| node == "a" && *action == NodeAction::Rollback)
            {
                assert_eq!(previous.as_deref(), Some("1.0.0"));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let third = c.create("billing", "3.0.0", None).await.unwrap();
        assert_eq!(third.node("a").unwrap().previous_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn batch_rollback_rejected_while_any_node_deploying() {
        let (c, executor) = setup(&["a", "b"]);
        let record = c.create("billing", "2.0.0", Some("a")).await.unwrap();
        wait_node(&c, &record.id, "a", NodeStatus::Success).await;

        let gate = executor.gate("b");
        c.apply(&record.id, NodeAction::Deploy, &ids(&["b"])).await.unwrap();

        let results = c
            .apply(&record.id, NodeAction::Rollback, &ids(&["a", "b"]))
            .await
            .unwrap();
        assert!(
            results
                .iter()
                .all(|r| r.error() == Some(ErrorKind::Validation))
        );
        let current = c.get(&record.id).await.unwrap();
        assert_eq!(current.node("a").unwrap().status, NodeStatus::Success);

        gate.notify_one();
        wait_node(&c, &record.id, "b", NodeStatus::Success).await;
    }

    #[tokio::test]
    async fn duplicate_and_unknown_ids() {
        let (c, _) = setup(&["a", "b"]);
        let record = c.create("billing", "2.0.0", None).await.unwrap();
        let results = c
            .apply(&record.id, NodeAction::Skip, &ids(&["a", "a", "zz"]))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_applied());
        assert_eq!(results[1].error(), Some(ErrorKind::Validation));
        assert_eq!(results[2].error(), Some(ErrorKind::NotFound));

        let stored = c.store().get_deployment(&record.id).unwrap().unwrap();
        assert_eq!(stored.node("a").unwrap().status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn terminal_deployment_rejects_every_node() {
        let (c, _) = setup(&["a", "b"]);
        let record = c.create("billing", "2.0.0", None).await.unwrap();
        let closed = c.cancel(&record.id).await.unwrap();
        assert_eq!(closed.status, DeploymentStatus::Canceled);

        let results = c
            .apply(&record.id, NodeAction::Deploy, &ids(&["a", "b"]))
            .await
            .unwrap();
        assert!(
            results
                .iter()
                .all(|r| r.error() == Some(ErrorKind::Validation))
        );
        assert!(matches!(c.cancel(&record.id).await, Err(RolloutError::Validation(_))));
        assert!(matches!(c.rollback(&record.id).await, Err(RolloutError::Validation(_))));
    }

    #[tokio::test]
    async fn cancel_lets_in_flight_execution_finish() {
        let (c, executor) = setup(&["a", "b"]);
        let gate = executor.gate("a");
        let record = c.create("billing", "2.0.0", Some("a")).await.unwrap();

        let closed = c.cancel(&record.id).await.unwrap();
        assert_eq!(closed.status, DeploymentStatus::Canceled);
        assert_eq!(closed.node("a").unwrap().status, NodeStatus::Deploying);
        assert_eq!(closed.node("b").unwrap().status, NodeStatus::Canceled);

        gate.notify_one();
        wait_node(&c, &record.id, "a", NodeStatus::Success).await;
        assert_eq!(c.get(&record.id).await.unwrap().status, DeploymentStatus::Canceled);
    }

    #[tokio::test]
    async fn whole_rollback_rejected_while_deploying() {
        let (c, executor) = setup(&["a", "b"]);
        let gate = executor.gate("a");
        let record = c.create("billing", "2.0.0", Some("a")).await.unwrap();
        assert!(matches!(c.rollback(&record.id).await, Err(RolloutError::Validation(_))));

        gate.notify_one();
        wait_node(&c, &record.id, "a", NodeStatus::Success).await;
        let closed = c.rollback(&record.id).await.unwrap();
        assert_eq!(closed.status, DeploymentStatus::RolledBack);
        assert_eq!(closed.node("a").unwrap().status, NodeStatus::RolledBack);
        assert_eq!(closed.node("b").unwrap().status, NodeStatus::Canceled);
    }

    #[tokio::test]
    async fn restore_redispatches_deploying_nodes() {
        let (c, _) = setup(&["a", "b"]);
        let application = c.store().get_application("billing").unwrap().unwrap();
        let orphan = Deployment::create(&application, "3.0.0", Some("b")).unwrap();
        c.store().put_deployment(orphan.record()).unwrap();

        assert_eq!(c.restore().await.unwrap(), 1);
        wait_node(&c, orphan.id(), "b", NodeStatus::Success).await;
    }

    #[tokio::test]
    async fn events_follow_transitions() {
        let (c, _) = setup(&["a"]);
        let mut rx = c.subscribe();
        let record = c.create("billing", "2.0.0", Some("a")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            RolloutEvent::Created {
                deployment_id: record.id.clone(),
                app: "billing".into(),
                status: DeploymentStatus::Deploying,
            }
        );
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            next,
            RolloutEvent::NodeTransition {
                to: NodeStatus::Success,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn active_deployment_skips_closed_ones() {
        let (c, _) = setup(&["a"]);
        let first = c.create("billing", "1.0.0", None).await.unwrap();
        c.cancel(&first.id).await.unwrap();
        assert!(c.active_deployment("billing").await.is_none());

        let second = c.create("billing", "1.0.1", None).await.unwrap();
        let active = c.active_deployment("billing").await.unwrap();
        assert_eq!(active.id, second.id);
        assert!(c.active_deployment("ledger").await.is_none());
    }

    #[tokio::test]
    async fn report_reads_through_store() {
        let (c, _) = setup(&["a"]);
        let record = c.create("billing", "1.0.0", None).await.unwrap();
        assert!(matches!(c.report(&record.id).await, Err(RolloutError::NotFound(_))));

        c.store()
            .put_report(&DiagnosticReport {
                deployment_id: record.id.clone(),
                status: ReportStatus::Completed,
                content: "p95 within bounds".into(),
                expressions: vec!["histogram_quantile(0.95, rate(x[5m]))".into()],
                created_at: 1,
                updated_at: 2,
            })
            .unwrap();
        let report = c.report(&record.id).await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert!(matches!(c.report("missing").await, Err(RolloutError::NotFound(_))));
    }

    #[test]
    fn node_result_serializes_flat() {
        let result = NodeResult {
            node_id: "a".into(),
            outcome: NodeOutcome::Rejected {
                error: ErrorKind::Conflict,
                message: "busy".into(),
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["node_id"], "a");
        assert_eq!(json["result"], "rejected");
        assert_eq!(json["error"], "conflict");
    }
}
