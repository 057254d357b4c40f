//! Main integration module for Model Hub
//!
//! This module wires the model repository, the deployment controller and the
//! operation tracker together. Create, deploy and undeploy run as long-running
//! operations; update, delete and status answer directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{ModelInstance, Operation, OperationKind, OperationResult};
use common::types::InstanceKey;
use common::utils::execute_with_timeout;
use config::{defaults, ConfigManager};
use inference_engine::{InferenceServer, TritonClient};
use model_manager::{FileInstanceStore, InstanceStore, ModelRepository};
use orchestrator_core::{DeploymentController, Transition};
use storage_adapter::{BlobStore, MemoryBlobStore};
use task_scheduler::{workflow, LocalWorkflowEngine, OperationTracker};

// Re-export commonly used types
pub use model_manager::{BundleSource, ModelRequest};

/// Model Hub service
pub struct ModelHub {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Model store and instance records
    repository: Arc<ModelRepository>,

    /// Deployment state machine
    controller: Arc<DeploymentController>,

    /// Long-running operations
    operations: Arc<OperationTracker>,
}

impl ModelHub {
    /// Creates a hub with file-backed records and an HTTP inference server client
    pub fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        // Get state path from config
        let state_path = config_manager
            .get_path("state_path")
            .unwrap_or_else(|_| PathBuf::from(defaults::STATE_PATH));

        let instances = Arc::new(FileInstanceStore::new(state_path)?);
        let server = Arc::new(TritonClient::new(config_manager.clone())?);

        Self::with_parts(config_manager, instances, server)
    }

    /// Creates a hub over explicit record storage and inference server
    pub fn with_parts(
        config_manager: Arc<ConfigManager>,
        instances: Arc<dyn InstanceStore>,
        server: Arc<dyn InferenceServer>,
    ) -> Result<Self> {
        info!("Initializing Model Hub");

        let repository = Arc::new(ModelRepository::new(config_manager.clone(), instances.clone())?);
        let controller = Arc::new(DeploymentController::new(instances, server));

        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let engine = Arc::new(LocalWorkflowEngine::new(config_manager.clone(), blobs.clone()));
        let operations = Arc::new(OperationTracker::new(config_manager.clone(), engine, blobs));

        Ok(Self {
            config_manager,
            repository,
            controller,
            operations,
        })
    }

    /// Starts materializing a new instance, deploying it afterwards if requested
    ///
    /// Returns the operation name. A duplicate instance is rejected before the
    /// operation starts.
    pub async fn create_model(&self, request: ModelRequest) -> Result<String> {
        match self.repository.get_instance(&request.key).await {
            Ok(_) => {
                return Err(Error::AlreadyExists(format!(
                    "Model instance already exists: {}",
                    request.key
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let repository = self.repository.clone();
        let controller = self.controller.clone();

        self.operations
            .start(
                OperationKind::Create,
                workflow(move |cancel| async move {
                    let key = request.key.clone();
                    let deploy = request.deploy_requested;

                    let mut instance = repository.create_model(request).await?;
                    if deploy {
                        instance = controller.deploy(&key, &cancel).await?;
                    }

                    Ok(OperationResult::Create { instance })
                }),
            )
            .await
    }

    /// Rematerializes an OFFLINE or ERROR instance from a new bundle
    pub async fn update_model(&self, key: &InstanceKey, source: &BundleSource) -> Result<ModelInstance> {
        self.repository.update_model(key, source).await
    }

    /// Starts deploying an instance and returns the operation name
    pub async fn deploy(&self, key: &InstanceKey) -> Result<String> {
        let instance = self.check_transition(key, Transition::Deploy).await?;
        if instance.deployment_target().is_none() {
            return Err(Error::FailedPrecondition(format!(
                "Cannot deploy {}: no ensemble among {} components",
                key,
                instance.components.len()
            )));
        }

        let controller = self.controller.clone();
        let key = key.clone();

        self.operations
            .start(
                OperationKind::Deploy,
                workflow(move |cancel| async move {
                    let instance = controller.deploy(&key, &cancel).await?;
                    Ok(OperationResult::Deploy {
                        instance: instance.key,
                        state: instance.state,
                    })
                }),
            )
            .await
    }

    /// Starts undeploying an instance and returns the operation name
    pub async fn undeploy(&self, key: &InstanceKey) -> Result<String> {
        self.check_transition(key, Transition::Undeploy).await?;

        let controller = self.controller.clone();
        let key = key.clone();

        self.operations
            .start(
                OperationKind::Undeploy,
                workflow(move |cancel| async move {
                    let instance = controller.undeploy(&key, &cancel).await?;
                    Ok(OperationResult::Undeploy {
                        instance: instance.key,
                        state: instance.state,
                    })
                }),
            )
            .await
    }

    /// Removes an instance that is not deployed
    pub async fn delete_model(&self, key: &InstanceKey) -> Result<()> {
        self.repository.delete_model(key).await
    }

    /// Gets an instance record
    pub async fn get_instance(&self, key: &InstanceKey) -> Result<ModelInstance> {
        self.repository.get_instance(key).await
    }

    /// Lists all instance records
    pub async fn list_instances(&self) -> Result<Vec<ModelInstance>> {
        self.repository.list_instances().await
    }

    /// Looks an operation up
    pub async fn get_operation(&self, name: &str) -> Result<Operation> {
        self.operations.get(name).await
    }

    /// Requests cancellation of an operation
    pub async fn cancel_operation(&self, name: &str) -> Result<()> {
        self.operations.cancel(name).await
    }

    /// Polls an operation until it is done
    pub async fn wait_operation(&self, name: &str, poll_interval: Duration) -> Result<Operation> {
        loop {
            let operation = self.operations.get(name).await?;
            if operation.done {
                return Ok(operation);
            }
            debug!("Operation {} still running", name);
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Polls an instance until it leaves TRANSITIONING, bounded by `limit`
    pub async fn wait_stable(&self, key: &InstanceKey, poll_interval: Duration, limit: Duration) -> Result<ModelInstance> {
        let poll = async {
            loop {
                let instance = self.repository.get_instance(key).await?;
                if instance.state.is_stable() {
                    return Ok::<_, Error>(instance);
                }
                debug!("Instance {} still transitioning", key);
                tokio::time::sleep(poll_interval).await;
            }
        };

        execute_with_timeout(poll, limit, &format!("wait for {}", key)).await
    }

    /// Resolves every instance left TRANSITIONING by an earlier process
    ///
    /// Returns the number of instances reconciled.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut reconciled = 0;
        for instance in self.repository.list_instances().await? {
            if instance.state.is_stable() {
                continue;
            }
            match self.controller.reconcile(&instance.key).await {
                Ok(resolved) => {
                    info!("Instance {} reconciled to {}", resolved.key, resolved.state);
                    reconciled += 1;
                }
                Err(e) => warn!("Failed to reconcile {}: {}", instance.key, e),
            }
        }

        Ok(reconciled)
    }

    /// Gets the configuration manager
    pub fn get_config_manager(&self) -> Arc<ConfigManager> {
        self.config_manager.clone()
    }

    /// Gets the model repository
    pub fn get_repository(&self) -> Arc<ModelRepository> {
        self.repository.clone()
    }

    async fn check_transition(&self, key: &InstanceKey, transition: Transition) -> Result<ModelInstance> {
        let instance = self.repository.get_instance(key).await?;
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
}
