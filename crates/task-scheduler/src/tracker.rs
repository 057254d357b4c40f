//! Operation tracking
//!
//! Operations are named `operations/{execution id}`. Their state is never
//! stored here; every lookup asks the workflow engine for the execution
//! status and, once completed, reads the result blob it left behind.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use common::error::{Error, ErrorKind, Result};
use common::models::{Operation, OperationError, OperationKind, OperationResult};
use common::utils::execute_with_timeout;
use config::{defaults, ConfigManager};
use storage_adapter::BlobStore;

use crate::engine::{ExecutionDescription, ExecutionStatus, Workflow, WorkflowEngine};

/// Prefix of every operation name
pub const OPERATION_PREFIX: &str = "operations/";

/// Starts workflows and reports them as operations
pub struct OperationTracker {
    /// Engine running the workflows
    engine: Arc<dyn WorkflowEngine>,

    /// Result blobs written by the engine
    blobs: Arc<dyn BlobStore>,

    /// Upper bound on a single status lookup
    get_timeout: Duration,
}

impl OperationTracker {
    /// Creates a new operation tracker
    pub fn new(
        config_manager: Arc<ConfigManager>,
        engine: Arc<dyn WorkflowEngine>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        // Get lookup timeout from config
        let get_timeout = config_manager
            .get_duration("operation_get_timeout_ms")
            .unwrap_or_else(|_| Duration::from_millis(defaults::OPERATION_GET_TIMEOUT_MS as u64));

        Self::with_timeout(engine, blobs, get_timeout)
    }

    /// Creates a tracker with an explicit lookup timeout
    pub fn with_timeout(engine: Arc<dyn WorkflowEngine>, blobs: Arc<dyn BlobStore>, get_timeout: Duration) -> Self {
        Self {
            engine,
            blobs,
            get_timeout,
        }
    }

    /// Starts a workflow and returns the operation name
    pub async fn start(&self, kind: OperationKind, workflow: Workflow) -> Result<String> {
        let execution_id = self.engine.start_execution(kind, workflow).await?;
        let name = format!("{}{}", OPERATION_PREFIX, execution_id);

        info!("Started operation {}", name);

        Ok(name)
    }

    /// Looks an operation up
    ///
    /// Running executions are reported not done. Every terminal status other
    /// than COMPLETED is reported done with an error; a completed execution
    /// whose result blob is gone or unreadable is reported the same way.
    pub async fn get(&self, name: &str) -> Result<Operation> {
        let execution_id = execution_id(name)?;
        let kind = kind_of(execution_id);

        let description = execute_with_timeout(
            self.engine.describe_execution(execution_id),
            self.get_timeout,
            "describe execution",
        )
        .await?;

        let mut operation = Operation {
            name: name.to_string(),
            kind,
            done: true,
            result: None,
            error: None,
        };

        match ExecutionStatus::from_code(description.status_code) {
            Some(status) if status.is_running() => {
                operation.done = false;
            }
            Some(ExecutionStatus::Completed) => match self.read_result(execution_id).await {
                Ok(result) => operation.result = Some(result),
                Err(e) => {
                    warn!("Operation {} completed without a usable result: {}", name, e);
                    operation.error = Some(OperationError::from(e));
                }
            },
            status => {
                operation.error = Some(terminal_error(execution_id, status, description));
            }
        }

        debug!("Operation {} done={}", name, operation.done);

        Ok(operation)
    }

    /// Requests cancellation of an operation
    pub async fn cancel(&self, name: &str) -> Result<()> {
        let execution_id = execution_id(name)?;
        self.engine.cancel_execution(execution_id).await?;

        info!("Cancellation requested for {}", name);

        Ok(())
    }

    async fn read_result(&self, execution_id: &str) -> Result<OperationResult> {
        let blob = self.blobs.get(execution_id).await?.ok_or_else(|| {
            Error::status(ErrorKind::Internal, "Operation result is no longer available")
                .with_detail("execution_id", execution_id)
        })?;

        serde_json::from_slice(&blob).map_err(|e| {
            Error::status(ErrorKind::Internal, format!("Operation result is unreadable: {}", e))
                .with_detail("execution_id", execution_id)
        })
    }
}

fn execution_id(name: &str) -> Result<&str> {
    match name.strip_prefix(OPERATION_PREFIX) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(Error::InvalidArgument(format!(
            "Operation name must look like {}{{id}}: {}",
            OPERATION_PREFIX, name
        ))),
    }
}

fn kind_of(execution_id: &str) -> Option<OperationKind> {
    execution_id
        .split_once('-')
        .and_then(|(kind, _)| OperationKind::from_name(kind))
}

fn terminal_error(
    execution_id: &str,
    status: Option<ExecutionStatus>,
    description: ExecutionDescription,
) -> OperationError {
    let mut error = description.failure.unwrap_or_else(|| {
        let (kind, message) = match status {
            Some(ExecutionStatus::Canceled) => (ErrorKind::Cancelled, "Operation was cancelled".to_string()),
            Some(ExecutionStatus::TimedOut) => (ErrorKind::DeadlineExceeded, "Operation timed out".to_string()),
            Some(other) => (ErrorKind::Internal, format!("Operation ended {}", other)),
            None => (
                ErrorKind::Internal,
                format!("Operation ended with unknown status {}", description.status_code),
            ),
        };
        OperationError {
            kind,
            message,
            details: Default::default(),
        }
    });

    error
        .details
        .insert("status_code".to_string(), description.status_code.to_string());
    error
        .details
        .entry("execution_id".to_string())
        .or_insert_with(|| execution_id.to_string());

    error
}
