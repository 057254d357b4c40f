//! Long-running operation tracking for Model Hub
//!
//! Create, deploy and undeploy actions run as workflow executions. This crate
//! defines the workflow engine contract, an in-process engine, and the
//! tracker that turns execution status plus result blobs into client-visible
//! operations.

mod engine;
mod tracker;

pub use engine::{workflow, ExecutionDescription, ExecutionStatus, LocalWorkflowEngine, Workflow, WorkflowEngine};
pub use tracker::{OperationTracker, OPERATION_PREFIX};
