//! HTTP client for the KServe v2 model repository extension
//!
//! Canonical names contain `#`, so every name is percent-encoded as a single
//! path segment.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use config::ConfigManager;

use crate::server::InferenceServer;

/// Error body returned by the server
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Inference server reached over HTTP
pub struct TritonClient {
    /// HTTP client
    client: Client,

    /// Server base URL
    base_url: Url,
}

impl TritonClient {
    /// Creates a client from `inference_server_url` and `inference_request_timeout_ms`
    pub fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        let base_url = config_manager.get_string("inference_server_url")?;
        let timeout = config_manager
            .get_duration("inference_request_timeout_ms")
            .unwrap_or_else(|_| Duration::from_secs(600));

        Self::with_base_url(&base_url, timeout)
    }

    /// Creates a client for an explicit base URL
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid inference server URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("Inference server URL '{}' cannot be a base", base_url)));
        }

        let client = Client::builder()
            .user_agent("model-hub/0.1.0")
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// Builds `{base}/v2/{segments...}` with every segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Internal(format!("Inference server URL '{}' cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("v2")
            .extend(segments);
        Ok(url)
    }

    async fn repository_call(&self, name: &str, action: &str) -> Result<()> {
        let url = self.endpoint(&["repository", "models", name, action])?;
        debug!("POST {}", url);

        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("Failed to {} {}: {}", action, name, e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(Error::ExternalService(format!(
            "Failed to {} {}: HTTP {}: {}",
            action,
            name,
            status,
            error_message(&body)
        )))
    }
}

/// Extracts the server's error text from a response body
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.trim().to_string(),
    }
}

#[async_trait]
impl InferenceServer for TritonClient {
    async fn load(&self, name: &str) -> Result<()> {
        info!("Loading {} on inference server", name);
        self.repository_call(name, "load").await
    }

    async fn unload(&self, name: &str) -> Result<()> {
        info!("Unloading {} from inference server", name);
        self.repository_call(name, "unload").await
    }

    async fn is_ready(&self, name: &str) -> Result<bool> {
        let url = self.endpoint(&["models", name, "ready"])?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("Failed to query readiness of {}: {}", name, e)))?;

        match resp.status() {
            StatusCode::OK => Ok(true),
            status if status.is_client_error() => Ok(false),
            status => {
                warn!("Readiness query for {} returned HTTP {}", name, status);
                Err(Error::ExternalService(format!(
                    "Readiness query for {} returned HTTP {}",
                    name, status
                )))
            }
        }
    }
}
