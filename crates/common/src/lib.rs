//! Common utilities and types for Model Hub
//!
//! This crate provides shared functionality used across the Model Hub workspace,
//! including error types, the instance/component data model, canonical names
//! and utility functions.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use types::*;
