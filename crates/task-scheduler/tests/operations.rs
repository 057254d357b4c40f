use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;

use common::error::{Error, ErrorKind, Result};
use common::models::{DeploymentState, Operation, OperationKind, OperationResult};
use common::types::InstanceKey;
use storage_adapter::{BlobStore, MemoryBlobStore};
use task_scheduler::{
    workflow, ExecutionDescription, LocalWorkflowEngine, OperationTracker, Workflow, WorkflowEngine,
};

/// Engine double reporting a fixed description for every execution
struct ScriptedEngine {
    description: Mutex<ExecutionDescription>,
    delay: Duration,
}

impl ScriptedEngine {
    fn with_code(status_code: i32) -> Self {
        Self {
            description: Mutex::new(ExecutionDescription {
                status_code,
                failure: None,
            }),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl WorkflowEngine for ScriptedEngine {
    async fn start_execution(&self, kind: OperationKind, _workflow: Workflow) -> Result<String> {
        Ok(format!("{}-scripted", kind))
    }

    async fn describe_execution(&self, _execution_id: &str) -> Result<ExecutionDescription> {
        tokio::time::sleep(self.delay).await;
        Ok(self.description.lock().unwrap().clone())
    }

    async fn cancel_execution(&self, _execution_id: &str) -> Result<()> {
        Ok(())
    }
}

fn key() -> InstanceKey {
    InstanceKey::new("acme", "cat", "v1").unwrap()
}

fn noop() -> Workflow {
    workflow(|_| async { Err(Error::Internal("never run".to_string())) })
}

async fn poll(tracker: &OperationTracker, name: &str) -> Operation {
    for _ in 0..200 {
        let operation = tracker.get(name).await.unwrap();
        if operation.done {
            return operation;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation {} never finished", name);
}

#[tokio::test]
async fn deploy_operation_completes_with_result() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let engine = Arc::new(LocalWorkflowEngine::with_ttl(blobs.clone(), Duration::from_secs(60)));
    let tracker = OperationTracker::with_timeout(engine, blobs, Duration::from_secs(1));

    let instance = key();
    let name = tracker
        .start(
            OperationKind::Deploy,
            workflow(move |_| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(OperationResult::Deploy {
                    instance,
                    state: DeploymentState::Online,
                })
            }),
        )
        .await
        .unwrap();
    assert!(name.starts_with("operations/deploy-"));

    let pending = tracker.get(&name).await.unwrap();
    assert!(!pending.done);
    assert_eq!(pending.kind, Some(OperationKind::Deploy));

    let operation = poll(&tracker, &name).await;
    assert!(operation.error.is_none());
    assert_eq!(
        operation.result,
        Some(OperationResult::Deploy {
            instance: key(),
            state: DeploymentState::Online,
        })
    );
}

#[tokio::test]
async fn failed_workflow_reports_its_error() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let engine = Arc::new(LocalWorkflowEngine::with_ttl(blobs.clone(), Duration::from_secs(60)));
    let tracker = OperationTracker::with_timeout(engine, blobs, Duration::from_secs(1));

    let name = tracker
        .start(
            OperationKind::Deploy,
            workflow(|_| async { Err(Error::ResourceExhausted("Failed to allocate memory".to_string())) }),
        )
        .await
        .unwrap();

    let operation = poll(&tracker, &name).await;
    let error = operation.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ResourceExhausted);
    assert_eq!(error.details["status_code"], "3");
    assert!(operation.result.is_none());
}

#[tokio::test]
async fn cancelled_operation_is_done_immediately() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let engine = Arc::new(LocalWorkflowEngine::with_ttl(blobs.clone(), Duration::from_secs(60)));
    let tracker = OperationTracker::with_timeout(engine, blobs, Duration::from_secs(1));

    let name = tracker
        .start(
            OperationKind::Undeploy,
            workflow(|cancel| async move {
                cancel.cancelled().await;
                Err(Error::Cancelled("undeploy interrupted".to_string()))
            }),
        )
        .await
        .unwrap();

    tracker.cancel(&name).await.unwrap();

    let operation = tracker.get(&name).await.unwrap();
    assert!(operation.done);
    assert_eq!(operation.error.unwrap().kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn completed_without_blob_is_an_error() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let tracker = OperationTracker::with_timeout(Arc::new(ScriptedEngine::with_code(2)), blobs.clone(), Duration::from_secs(1));

    let name = tracker.start(OperationKind::Create, noop()).await.unwrap();
    let operation = tracker.get(&name).await.unwrap();
    assert!(operation.done);
    assert_eq!(operation.error.as_ref().unwrap().kind, ErrorKind::Internal);
    assert_eq!(operation.error.unwrap().details["execution_id"], "create-scripted");

    blobs
        .set("create-scripted", Bytes::from_static(b"not json"), Duration::from_secs(60))
        .await
        .unwrap();
    let operation = tracker.get(&name).await.unwrap();
    assert!(operation.done);
    assert!(operation.error.unwrap().message.contains("unreadable"));
}

#[tokio::test]
async fn other_statuses_are_done_with_the_raw_code() {
    for (code, kind) in [
        (3, ErrorKind::Internal),
        (4, ErrorKind::Cancelled),
        (5, ErrorKind::Internal),
        (7, ErrorKind::DeadlineExceeded),
        (99, ErrorKind::Internal),
    ] {
        let tracker = OperationTracker::with_timeout(
            Arc::new(ScriptedEngine::with_code(code)),
            Arc::new(MemoryBlobStore::new()),
            Duration::from_secs(1),
        );
        let name = tracker.start(OperationKind::Deploy, noop()).await.unwrap();

        let operation = tracker.get(&name).await.unwrap();
        assert!(operation.done, "status {}", code);
        let error = operation.error.unwrap();
        assert_eq!(error.kind, kind, "status {}", code);
        assert_eq!(error.details["status_code"], code.to_string());
    }
}

#[tokio::test]
async fn continued_as_new_is_not_done() {
    let tracker = OperationTracker::with_timeout(
        Arc::new(ScriptedEngine::with_code(6)),
        Arc::new(MemoryBlobStore::new()),
        Duration::from_secs(1),
    );
    let name = tracker.start(OperationKind::Deploy, noop()).await.unwrap();

    let operation = tracker.get(&name).await.unwrap();
    assert!(!operation.done);
    assert!(operation.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_lookup_times_out() {
    let engine = ScriptedEngine {
        delay: Duration::from_secs(30),
        ..ScriptedEngine::with_code(1)
    };
    let tracker = OperationTracker::with_timeout(
        Arc::new(engine),
        Arc::new(MemoryBlobStore::new()),
        Duration::from_secs(5),
    );

    let err = tracker.get("operations/deploy-scripted").await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn malformed_names_are_rejected() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let engine = Arc::new(LocalWorkflowEngine::with_ttl(blobs.clone(), Duration::from_secs(60)));
    let tracker = OperationTracker::with_timeout(engine, blobs, Duration::from_secs(1));

    assert!(matches!(tracker.get("deploy-123").await, Err(Error::InvalidArgument(_))));
    assert!(tracker.get("operations/deploy-unknown").await.unwrap_err().is_not_found());
}
