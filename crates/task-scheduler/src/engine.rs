//! Workflow engine implementation
//!
//! This module defines the contract the operation tracker polls and an
//! in-process engine that runs workflows as tokio tasks. Results never travel
//! through the engine itself: a completed workflow's result is serialized
//! into the blob store under its execution id.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::error::{Error, Result};
use common::models::{OperationError, OperationKind, OperationResult};
use config::{defaults, ConfigManager};
use storage_adapter::BlobStore;

/// Work run by an execution; receives the execution's cancellation token
pub type Workflow = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<OperationResult>> + Send>;

/// Boxes an async closure into a [`Workflow`]
pub fn workflow<F, Fut>(f: F) -> Workflow
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<OperationResult>> + Send + 'static,
{
    Box::new(move |cancel| f(cancel).boxed())
}

/// Status of a workflow execution, with the engine's wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

impl ExecutionStatus {
    /// Wire code of the status
    pub fn code(&self) -> i32 {
        match self {
            ExecutionStatus::Running => 1,
            ExecutionStatus::Completed => 2,
            ExecutionStatus::Failed => 3,
            ExecutionStatus::Canceled => 4,
            ExecutionStatus::Terminated => 5,
            ExecutionStatus::ContinuedAsNew => 6,
            ExecutionStatus::TimedOut => 7,
        }
    }

    /// Looks a status up by wire code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ExecutionStatus::Running),
            2 => Some(ExecutionStatus::Completed),
            3 => Some(ExecutionStatus::Failed),
            4 => Some(ExecutionStatus::Canceled),
            5 => Some(ExecutionStatus::Terminated),
            6 => Some(ExecutionStatus::ContinuedAsNew),
            7 => Some(ExecutionStatus::TimedOut),
            _ => None,
        }
    }

    /// Returns true while the execution may still produce a result
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::ContinuedAsNew)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Canceled => "CANCELED",
            ExecutionStatus::Terminated => "TERMINATED",
            ExecutionStatus::ContinuedAsNew => "CONTINUED_AS_NEW",
            ExecutionStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// What the engine reports about an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDescription {
    /// Raw status code; may be one [`ExecutionStatus`] does not know
    pub status_code: i32,
    /// Failure reported by the workflow, when the engine keeps one
    pub failure: Option<OperationError>,
}

/// Runs workflows and reports their status
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Starts a workflow and returns its execution id
    async fn start_execution(&self, kind: OperationKind, workflow: Workflow) -> Result<String>;

    /// Describes an execution; `NotFound` for unknown ids
    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription>;

    /// Requests cancellation of an execution
    async fn cancel_execution(&self, execution_id: &str) -> Result<()>;
}

#[derive(Debug)]
struct Execution {
    status: ExecutionStatus,
    failure: Option<OperationError>,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

/// [`WorkflowEngine`] running workflows as tokio tasks
pub struct LocalWorkflowEngine {
    /// Executions by id
    executions: Arc<DashMap<String, Execution>>,

    /// Where completed results go
    blobs: Arc<dyn BlobStore>,

    /// Lifetime of result blobs and of finished execution records
    result_ttl: Duration,
}

impl LocalWorkflowEngine {
    /// Creates an engine using `operation_result_ttl_ms`
    pub fn new(config_manager: Arc<ConfigManager>, blobs: Arc<dyn BlobStore>) -> Self {
        // Get result TTL from config
        let result_ttl = config_manager
            .get_duration("operation_result_ttl_ms")
            .unwrap_or_else(|_| Duration::from_millis(defaults::OPERATION_RESULT_TTL_MS as u64));

        Self::with_ttl(blobs, result_ttl)
    }

    /// Creates an engine with an explicit result TTL
    pub fn with_ttl(blobs: Arc<dyn BlobStore>, result_ttl: Duration) -> Self {
        Self {
            executions: Arc::new(DashMap::new()),
            blobs,
            result_ttl,
        }
    }

    /// Forgets finished executions older than the result TTL
    pub fn purge_finished(&self) -> usize {
        let now = Instant::now();
        let before = self.executions.len();
        self.executions.retain(|_, execution| {
            execution
                .finished_at
                .map_or(true, |finished| now.duration_since(finished) < self.result_ttl)
        });
        before - self.executions.len()
    }

    fn finish(executions: &DashMap<String, Execution>, id: &str, status: ExecutionStatus, failure: Option<OperationError>) {
        if let Some(mut execution) = executions.get_mut(id) {
            execution.finished_at = Some(Instant::now());
            // A cancelled execution stays cancelled whatever the workflow returned
            if execution.status == ExecutionStatus::Canceled {
                return;
            }
            execution.status = status;
            execution.failure = failure;
        }
    }
}

#[async_trait]
impl WorkflowEngine for LocalWorkflowEngine {
    async fn start_execution(&self, kind: OperationKind, workflow: Workflow) -> Result<String> {
        let purged = self.purge_finished();
        if purged > 0 {
            debug!("Purged {} finished executions", purged);
        }

        let id = format!("{}-{}", kind.name(), Uuid::new_v4());
        let cancel = CancellationToken::new();

        self.executions.insert(
            id.clone(),
            Execution {
                status: ExecutionStatus::Running,
                failure: None,
                cancel: cancel.clone(),
                finished_at: None,
            },
        );

        let executions = self.executions.clone();
        let blobs = self.blobs.clone();
        let ttl = self.result_ttl;
        let execution_id = id.clone();

        tokio::spawn(async move {
            // Inner task: a panic surfaces as a JoinError
            let outcome = tokio::spawn(workflow(cancel.clone())).await;

            let (status, failure) = match outcome {
                Ok(Ok(result)) => match store_result(blobs.as_ref(), &execution_id, &result, ttl).await {
                    Ok(()) => (ExecutionStatus::Completed, None),
                    Err(e) => {
                        error!("Failed to store result of {}: {}", execution_id, e);
                        (ExecutionStatus::Failed, Some(OperationError::from(e)))
                    }
                },
                Ok(Err(e)) if e.is_cancelled() || cancel.is_cancelled() => {
                    (ExecutionStatus::Canceled, Some(OperationError::from(e)))
                }
                Ok(Err(e)) => {
                    warn!("Execution {} failed: {}", execution_id, e);
                    (ExecutionStatus::Failed, Some(OperationError::from(e)))
                }
                Err(e) => {
                    error!("Execution {} aborted: {}", execution_id, e);
                    (
                        ExecutionStatus::Failed,
                        Some(OperationError::from(Error::Internal(format!("workflow aborted: {}", e)))),
                    )
                }
            };

            info!("Execution {} finished: {}", execution_id, status);
            Self::finish(&executions, &execution_id, status, failure);
        });

        info!("Started execution {}", id);

        Ok(id)
    }

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription> {
        self.executions
            .get(execution_id)
            .map(|execution| ExecutionDescription {
                status_code: execution.status.code(),
                failure: execution.failure.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("Execution not found: {}", execution_id)))
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| Error::NotFound(format!("Execution not found: {}", execution_id)))?;

        if !execution.status.is_running() {
            debug!("Execution {} already {}", execution_id, execution.status);
            return Ok(());
        }

        execution.cancel.cancel();
        execution.status = ExecutionStatus::Canceled;
        execution.failure = Some(OperationError::from(Error::Cancelled(format!(
            "Execution {} was cancelled",
            execution_id
        ))));

        info!("Cancelled execution {}", execution_id);

        Ok(())
    }
}

async fn store_result(blobs: &dyn BlobStore, key: &str, result: &OperationResult, ttl: Duration) -> Result<()> {
    let bytes = serde_json::to_vec(result)?;
    blobs.set(key, Bytes::from(bytes), ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::DeploymentState;
    use common::types::InstanceKey;
    use storage_adapter::MemoryBlobStore;

    fn deploy_result() -> OperationResult {
        OperationResult::Deploy {
            instance: InstanceKey::new("acme", "cat", "v1").unwrap(),
            state: DeploymentState::Online,
        }
    }

    async fn wait_for(engine: &LocalWorkflowEngine, id: &str) -> ExecutionDescription {
        for _ in 0..100 {
            let description = engine.describe_execution(id).await.unwrap();
            if description.status_code != ExecutionStatus::Running.code() {
                return description;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} did not finish", id);
    }

    #[test]
    fn test_status_codes() {
        for code in 1..=7 {
            assert_eq!(ExecutionStatus::from_code(code).unwrap().code(), code);
        }
        assert_eq!(ExecutionStatus::from_code(0), None);
        assert_eq!(ExecutionStatus::from_code(8), None);
        assert!(ExecutionStatus::ContinuedAsNew.is_running());
        assert!(!ExecutionStatus::TimedOut.is_running());
    }

    #[tokio::test]
    async fn test_completed_result_is_stored_as_blob() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = LocalWorkflowEngine::with_ttl(blobs.clone(), Duration::from_secs(60));

        let id = engine
            .start_execution(OperationKind::Deploy, workflow(|_| async { Ok(deploy_result()) }))
            .await
            .unwrap();
        assert!(id.starts_with("deploy-"));

        let description = wait_for(&engine, &id).await;
        assert_eq!(description.status_code, ExecutionStatus::Completed.code());

        let blob = blobs.get(&id).await.unwrap().unwrap();
        let result: OperationResult = serde_json::from_slice(&blob).unwrap();
        assert_eq!(result, deploy_result());
    }

    #[tokio::test]
    async fn test_failure_is_kept() {
        let engine = LocalWorkflowEngine::with_ttl(Arc::new(MemoryBlobStore::new()), Duration::from_secs(60));

        let id = engine
            .start_execution(
                OperationKind::Create,
                workflow(|_| async { Err(Error::InvalidArgument("bad bundle".to_string())) }),
            )
            .await
            .unwrap();

        let description = wait_for(&engine, &id).await;
        assert_eq!(description.status_code, ExecutionStatus::Failed.code());
        assert_eq!(description.failure.unwrap().message, "Invalid argument: bad bundle");
    }

    #[tokio::test]
    async fn test_cancel_reaches_workflow() {
        let engine = LocalWorkflowEngine::with_ttl(Arc::new(MemoryBlobStore::new()), Duration::from_secs(60));

        let id = engine
            .start_execution(
                OperationKind::Deploy,
                workflow(|cancel| async move {
                    cancel.cancelled().await;
                    Err(Error::Cancelled("stopped".to_string()))
                }),
            )
            .await
            .unwrap();

        engine.cancel_execution(&id).await.unwrap();
        let description = engine.describe_execution(&id).await.unwrap();
        assert_eq!(description.status_code, ExecutionStatus::Canceled.code());

        // Cancelling a finished execution is a no-op
        engine.cancel_execution(&id).await.unwrap();
        assert!(engine.cancel_execution("deploy-unknown").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_panicking_workflow_fails() {
        let engine = LocalWorkflowEngine::with_ttl(Arc::new(MemoryBlobStore::new()), Duration::from_secs(60));

        let id = engine
            .start_execution(
                OperationKind::Undeploy,
                workflow(|_| async {
                    if true {
                        panic!("boom");
                    }
                    Ok(deploy_result())
                }),
            )
            .await
            .unwrap();

        let description = wait_for(&engine, &id).await;
        assert_eq!(description.status_code, ExecutionStatus::Failed.code());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_executions_are_purged() {
        let engine = LocalWorkflowEngine::with_ttl(Arc::new(MemoryBlobStore::new()), Duration::from_secs(60));

        let id = engine
            .start_execution(OperationKind::Deploy, workflow(|_| async { Ok(deploy_result()) }))
            .await
            .unwrap();
        wait_for(&engine, &id).await;

        assert_eq!(engine.purge_finished(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(engine.purge_finished(), 1);
        assert!(engine.describe_execution(&id).await.unwrap_err().is_not_found());
    }
}
