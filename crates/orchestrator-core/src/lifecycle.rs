//! Deployment lifecycle management
//!
//! This module moves model instances between deployment states. Every
//! transition is persisted as TRANSITIONING before the inference server is
//! called, and resolved to a stable state afterwards.
//!
//! The precondition check is a read of the persisted state, not a lock: two
//! deploys racing between the read and the TRANSITIONING write can both
//! reach the server. A deploy that reads TRANSITIONING is rejected.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::models::{DeploymentState, ModelInstance};
use common::types::InstanceKey;
use inference_engine::InferenceServer;
use model_manager::InstanceStore;

use crate::state::Transition;

/// Server error text reported when a load runs out of memory
pub const ALLOCATION_FAILURE: &str = "Failed to allocate memory";

/// Maps a failed load to the error returned to the caller
fn classify_load_failure(target: &str, err: Error) -> Error {
    let message = err.to_string();
    if message.contains(ALLOCATION_FAILURE) {
        Error::ResourceExhausted(format!("Insufficient resources to load {}: {}", target, message))
    } else {
        err
    }
}

/// Restores the cancellation state if a transition future is dropped midway
struct TransitionGuard {
    instances: Arc<dyn InstanceStore>,
    key: InstanceKey,
    restore: DeploymentState,
    armed: bool,
}

impl TransitionGuard {
    fn new(instances: Arc<dyn InstanceStore>, key: InstanceKey, transition: Transition) -> Self {
        Self {
            instances,
            key,
            restore: transition.cancelled(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let instances = self.instances.clone();
        let key = self.key.clone();
        let restore = self.restore;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match instances.get(&key).await {
                        Ok(instance) if instance.state == DeploymentState::Transitioning => {
                            if let Err(e) = instances.update_state(&key, restore, None).await {
                                error!("Failed to restore {} to {}: {}", key, restore, e);
                            } else {
                                info!("Restored abandoned transition of {} to {}", key, restore);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to read {} after abandoned transition: {}", key, e),
                    }
                });
            }
            Err(_) => warn!("No runtime to restore {}; it stays TRANSITIONING until reconciled", key),
        }
    }
}

/// Drives the deployment state machine of model instances
pub struct DeploymentController {
    /// Instance records; the only place deployment state lives
    instances: Arc<dyn InstanceStore>,

    /// Inference server
    server: Arc<dyn InferenceServer>,
}

impl DeploymentController {
    /// Creates a new deployment controller
    pub fn new(instances: Arc<dyn InstanceStore>, server: Arc<dyn InferenceServer>) -> Self {
        Self { instances, server }
    }

    async fn begin(&self, key: &InstanceKey, transition: Transition) -> Result<ModelInstance> {
        let instance = self.instances.get(key).await?;

        if !transition.can_start_from(instance.state) {
            return Err(Error::FailedPrecondition(format!(
                "Cannot {} {}: state is {}, expected {}",
                transition,
                key,
                instance.state,
                transition.expected()
            )));
        }

        Ok(instance)
    }

    async fn cancel(&self, key: &InstanceKey, transition: Transition) -> Result<ModelInstance> {
        let restored = self.instances.update_state(key, transition.cancelled(), None).await?;
        warn!("{} of {} cancelled; restored {}", transition, key, restored.state);
        Err(Error::Cancelled(format!("{} of {} was cancelled", transition, key)))
    }

    async fn fail(&self, key: &InstanceKey, transition: Transition, err: Error) -> Result<ModelInstance> {
        error!("{} of {} failed: {}", transition, key, err);
        self.instances
            .update_state(key, DeploymentState::Error, Some(err.to_string()))
            .await?;
        Err(err)
    }

    /// Loads the instance's deployment target
    ///
    /// Requires OFFLINE or ERROR. Ends ONLINE on success and ERROR on server
    /// failure; allocation failures are reported as resource exhaustion.
    /// Cancellation restores OFFLINE.
    pub async fn deploy(&self, key: &InstanceKey, cancel: &CancellationToken) -> Result<ModelInstance> {
        let transition = Transition::Deploy;
        let instance = self.begin(key, transition).await?;

        let target = instance
            .deployment_target()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::FailedPrecondition(format!(
                    "Cannot deploy {}: no ensemble among {} components",
                    key,
                    instance.components.len()
                ))
            })?;

        self.instances
            .update_state(key, DeploymentState::Transitioning, None)
            .await?;
        let mut guard = TransitionGuard::new(self.instances.clone(), key.clone(), transition);

        info!("Deploying {} ({})", key, target);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.server.load(&target) => Some(result),
        };
        guard.disarm();

        match outcome {
            None => self.cancel(key, transition).await,
            Some(Ok(())) => {
                let instance = self
                    .instances
                    .update_state(key, transition.target(), None)
                    .await?;
                info!("Model instance {} is {}", key, instance.state);
                Ok(instance)
            }
            Some(Err(e)) => self.fail(key, transition, classify_load_failure(&target, e)).await,
        }
    }

    /// Unloads every component of the instance
    ///
    /// Requires ONLINE or ERROR. The ensemble goes first, then the remaining
    /// components in recorded order. The first failure ends in ERROR and no
    /// further component is unloaded. From ERROR, components the server does
    /// not report as loaded are skipped. Cancellation restores ONLINE.
    pub async fn undeploy(&self, key: &InstanceKey, cancel: &CancellationToken) -> Result<ModelInstance> {
        let transition = Transition::Undeploy;
        let instance = self.begin(key, transition).await?;
        let from_error = instance.state == DeploymentState::Error;

        let mut names: Vec<&str> = Vec::with_capacity(instance.components.len());
        if let Some(ensemble) = instance.ensemble.as_deref() {
            names.push(ensemble);
        }
        for component in &instance.components {
            if !names.contains(&component.canonical_name.as_str()) {
                names.push(&component.canonical_name);
            }
        }

        self.instances
            .update_state(key, DeploymentState::Transitioning, None)
            .await?;
        let mut guard = TransitionGuard::new(self.instances.clone(), key.clone(), transition);

        info!("Undeploying {} ({} components)", key, names.len());

        for name in names {
            if from_error {
                let ready = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.server.is_ready(name) => Some(result),
                };
                match ready {
                    None => {
                        guard.disarm();
                        return self.cancel(key, transition).await;
                    }
                    Some(Ok(false)) => {
                        debug!("Skipping {}: not loaded", name);
                        continue;
                    }
                    Some(Ok(true)) => {}
                    Some(Err(e)) => {
                        guard.disarm();
                        return self.fail(key, transition, e).await;
                    }
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.server.unload(name) => Some(result),
            };
            match outcome {
                None => {
                    guard.disarm();
                    return self.cancel(key, transition).await;
                }
                Some(Ok(())) => debug!("Unloaded {}", name),
                Some(Err(e)) => {
                    guard.disarm();
                    return self.fail(key, transition, e).await;
                }
            }
        }
        guard.disarm();

        let instance = self
            .instances
            .update_state(key, transition.target(), None)
            .await?;
        info!("Model instance {} is {}", key, instance.state);

        Ok(instance)
    }

    /// Resolves an instance left TRANSITIONING, e.g. by a crash
    ///
    /// The instance becomes ONLINE if the server reports its deployment
    /// target ready, OFFLINE otherwise. Stable instances are returned as-is.
    pub async fn reconcile(&self, key: &InstanceKey) -> Result<ModelInstance> {
        let instance = self.instances.get(key).await?;
        if instance.state != DeploymentState::Transitioning {
            return Ok(instance);
        }

        let ready = match instance.deployment_target() {
            Some(target) => self.server.is_ready(target).await?,
            None => false,
        };
        let state = if ready { DeploymentState::Online } else { DeploymentState::Offline };

        info!("Reconciled {} to {}", key, state);

        self.instances.update_state(key, state, None).await
    }
}
