//! Inference server client for Model Hub
//!
//! The inference server loads and unloads components from the shared model
//! store by canonical name. This crate defines that contract and an HTTP
//! client for servers exposing the KServe v2 model repository extension.

pub mod server;
pub mod triton;

// Re-export commonly used types
pub use server::InferenceServer;
pub use triton::TritonClient;
