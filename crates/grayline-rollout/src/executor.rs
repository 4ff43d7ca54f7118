//! Remote execution channel and the bounded pool that drives it.
//!
//! The transport itself lives outside Grayline. An [`Executor`] receives one
//! node action at a time and reports `success` or `failed` with log output.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use grayline_state::{DeploymentId, NodeRef};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::machine::{ExecutionStatus, NodeAction};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One node action handed to the execution channel.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub deployment_id: DeploymentId,
    pub app: String,
    pub version: String,
    /// Version the node ran before this deployment. A remote rollback
    /// restores it.
    pub previous_version: Option<String>,
    pub node: NodeRef,
    pub action: NodeAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub log: Vec<String>,
}

impl ExecutionOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            log: vec![reason.into()],
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution channel error: {0}")]
    Channel(String),
}

/// Executes node actions on remote hosts.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'_, Result<ExecutionOutcome, ExecutionError>>;
}

/// Succeeds immediately for every request.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor;

impl Executor for MockExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'_, Result<ExecutionOutcome, ExecutionError>> {
        Box::pin(async move {
            Ok(ExecutionOutcome {
                status: ExecutionStatus::Success,
                log: vec![match request.action {
                    NodeAction::Rollback => format!(
                        "mock rollback of {} to {} on {}",
                        request.app,
                        request.previous_version.as_deref().unwrap_or("unknown"),
                        request.node.address
                    ),
                    action => format!(
                        "mock {action} of {} {} on {}",
                        request.app, request.version, request.node.address
                    ),
                }],
            })
        })
    }
}

/// Runs `<program> <action> <node-id> <address> <app> <version> <previous-version>`.
///
/// The previous version is empty when unknown; a rollback without one fails
/// before launching. Exit status zero is `success`; stdout and stderr become
/// the log.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Executor for CommandExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'_, Result<ExecutionOutcome, ExecutionError>> {
        Box::pin(async move {
            if request.action == NodeAction::Rollback && request.previous_version.is_none() {
                return Ok(ExecutionOutcome::failed(format!(
                    "no previous version to roll back {} to",
                    request.node.id
                )));
            }
            let output = tokio::process::Command::new(&self.program)
                .arg(request.action.as_str())
                .arg(&request.node.id)
                .arg(&request.node.address)
                .arg(&request.app)
                .arg(&request.version)
                .arg(request.previous_version.as_deref().unwrap_or_default())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| ExecutionError::Launch {
                    program: self.program.display().to_string(),
                    reason: e.to_string(),
                })?;

            let mut log: Vec<String> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect();
            log.extend(
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .map(|line| format!("stderr: {line}")),
            );

            let status = if output.status.success() {
                ExecutionStatus::Success
            } else {
                log.push(format!("exited with {}", output.status));
                ExecutionStatus::Failed
            };
            Ok(ExecutionOutcome { status, log })
        })
    }
}

/// Bounds concurrent executions and applies the per-execution timeout.
#[derive(Clone)]
pub struct ExecutionPool {
    executor: Arc<dyn Executor>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ExecutionPool {
    pub fn new(executor: Arc<dyn Executor>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one request. Errors and timeouts are folded into a `failed` outcome.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let deployment = request.deployment_id.clone();
        let node = request.node.id.clone();

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return ExecutionOutcome::failed("execution pool closed"),
        };
        debug!(%deployment, %node, action = %request.action, "execution started");

        let result = tokio::time::timeout(self.timeout, self.executor.execute(request))
            .await
            .unwrap_or(Err(ExecutionError::Timeout(self.timeout)));

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%deployment, %node, error = %e, "execution failed");
                ExecutionOutcome::failed(e.to_string())
            }
        }
    }
}
