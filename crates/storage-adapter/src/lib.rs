//! Result blob storage for Model Hub
//!
//! This crate provides the key-value store used to hand serialized operation
//! results from the workflow engine to the operation tracker.

pub mod cache;

// Re-export commonly used types
pub use cache::{BlobStore, MemoryBlobStore};
