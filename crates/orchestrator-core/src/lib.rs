//! Deployment lifecycle control for Model Hub
//!
//! This crate drives model instances through the OFFLINE / TRANSITIONING /
//! ONLINE / ERROR state machine against an external inference server.

pub mod lifecycle;
pub mod state;

// Re-export commonly used types
pub use lifecycle::DeploymentController;
pub use state::Transition;
