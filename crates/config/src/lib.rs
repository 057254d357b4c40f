//! Configuration management for Model Hub
//!
//! This crate provides the configuration object constructed once at process
//! start and passed down to every component, layering defaults, an optional
//! configuration file and `MODEL_HUB_*` environment variables.

pub mod defaults;
pub mod manager;

// Re-export commonly used types
pub use manager::ConfigManager;
