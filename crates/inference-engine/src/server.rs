//! Inference server contract

use async_trait::async_trait;

use common::error::Result;

/// An external server that serves components out of the model store
///
/// Errors are opaque: callers classify them by message text.
#[async_trait]
pub trait InferenceServer: Send + Sync {
    /// Loads a component, and through it every component it references
    async fn load(&self, name: &str) -> Result<()>;

    /// Unloads a single component
    async fn unload(&self, name: &str) -> Result<()>;

    /// Whether the component is loaded and ready
    async fn is_ready(&self, name: &str) -> Result<bool>;
}
