//! Logging for Model Hub
//!
//! This crate installs the process-wide `tracing` subscriber, with structured
//! (JSON) or human-readable output and an optional rolling log file.

pub mod logger;

// Re-export commonly used types
pub use logger::{init, LogFormat, LogSettings};
