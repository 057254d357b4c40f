//! Model repository implementation
//!
//! This module owns the model store: it materializes bundles into it, keeps
//! the instance records that describe what was materialized, and removes an
//! instance's files by canonical-name prefix.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{DeploymentState, ModelInstance};
use common::types::{CanonicalName, InstanceKey};
use config::ConfigManager;

use crate::ensemble::EnsembleResolver;
use crate::materializer::{BundleMaterializer, MaterializedBundle};
use crate::path_guard::PathGuard;
use crate::source::{BundleSource, SourceFetcher};
use crate::store::InstanceStore;

/// Request to create a model instance
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Instance to create
    pub key: InstanceKey,
    /// Where the bundle comes from
    pub source: BundleSource,
    /// Whether the caller deploys right after creation; requires a deployment target
    pub deploy_requested: bool,
}

/// Repository for managing materialized model instances
pub struct ModelRepository {
    /// Model store root
    store_path: PathBuf,

    /// Confines removals to the model store
    guard: PathGuard,

    /// Prepares bundle sources
    fetcher: SourceFetcher,

    /// Shared ensemble resolver
    resolver: Arc<EnsembleResolver>,

    /// Instance records
    instances: Arc<dyn InstanceStore>,
}

impl ModelRepository {
    /// Creates a new model repository
    pub fn new(config_manager: Arc<ConfigManager>, instances: Arc<dyn InstanceStore>) -> Result<Self> {
        // Get store path from config
        let store_path = config_manager
            .get_path("model_store_path")
            .unwrap_or_else(|_| PathBuf::from("/var/lib/model-hub/models"));

        // Create store path if it doesn't exist
        if !store_path.exists() {
            std::fs::create_dir_all(&store_path)?;
        }

        let fetcher = SourceFetcher::new(config_manager)?;
        let resolver = Arc::new(EnsembleResolver::new()?);

        info!("Model repository at {}", store_path.display());

        Ok(Self {
            guard: PathGuard::new(&store_path),
            store_path,
            fetcher,
            resolver,
            instances,
        })
    }

    /// Model store root
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Instance records
    pub fn instances(&self) -> &Arc<dyn InstanceStore> {
        &self.instances
    }

    /// Gets an instance record
    pub async fn get_instance(&self, key: &InstanceKey) -> Result<ModelInstance> {
        self.instances.get(key).await
    }

    /// Lists all instance records
    pub async fn list_instances(&self) -> Result<Vec<ModelInstance>> {
        self.instances.list().await
    }

    /// Materializes `source` for `key` into the model store
    ///
    /// The blocking work runs on the blocking pool; temporary files of the
    /// source are removed whatever the outcome.
    pub async fn materialize(&self, key: &InstanceKey, source: &BundleSource) -> Result<MaterializedBundle> {
        let prepared = self.fetcher.prepare(source).await?;
        let materializer = BundleMaterializer::new(key.clone(), &self.store_path, self.resolver.clone());

        tokio::task::spawn_blocking(move || prepared.materialize(materializer))
            .await
            .map_err(|e| Error::Internal(format!("Materialization task failed: {}", e)))?
    }

    /// Materializes a new instance and records it as OFFLINE
    pub async fn create_model(&self, request: ModelRequest) -> Result<ModelInstance> {
        let ModelRequest { key, source, deploy_requested } = request;
        info!("Creating model instance {} from {}", key, source.describe());

        // Check if instance already exists
        match self.instances.get(&key).await {
            Ok(_) => {
                return Err(Error::AlreadyExists(format!("Model instance already exists: {}", key)));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // Leftovers of an earlier failed attempt
        self.remove_model_repository(&key).await?;

        let bundle = match self.materialize(&key, &source).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.cleanup(&key).await;
                return Err(e);
            }
        };

        let instance = ModelInstance::new(key.clone(), bundle.into_update());

        if deploy_requested && instance.deployment_target().is_none() {
            self.cleanup(&key).await;
            return Err(Error::InvalidArgument(format!(
                "No ensemble found in bundle for {}; {} components and none declares the ensemble platform",
                key,
                instance.components.len()
            )));
        }

        if let Err(e) = self.instances.insert(instance.clone()).await {
            if !e.is_already_exists() {
                self.cleanup(&key).await;
            }
            return Err(e);
        }

        info!(
            "Model instance {} created with {} components",
            key,
            instance.components.len()
        );

        Ok(instance)
    }

    /// Rematerializes an OFFLINE or ERROR instance from a new bundle
    pub async fn update_model(&self, key: &InstanceKey, source: &BundleSource) -> Result<ModelInstance> {
        info!("Updating model instance {} from {}", key, source.describe());

        let mut instance = self.instances.get(key).await?;
        if !matches!(instance.state, DeploymentState::Offline | DeploymentState::Error) {
            return Err(Error::FailedPrecondition(format!(
                "Model instance {} is {}; undeploy it before updating",
                key, instance.state
            )));
        }

        self.remove_model_repository(key).await?;

        // The record keeps its state; only the deployment controller moves it
        let bundle = match self.materialize(key, source).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.cleanup(key).await;
                warn!("Model instance {} has no files after failed update: {}", key, e);
                return Err(e);
            }
        };

        instance.apply_update(bundle.into_update());
        self.instances.put(instance.clone()).await?;

        info!("Model instance {} updated", key);

        Ok(instance)
    }

    /// Removes an instance's files and record
    pub async fn delete_model(&self, key: &InstanceKey) -> Result<()> {
        let instance = self.instances.get(key).await?;
        if matches!(instance.state, DeploymentState::Online | DeploymentState::Transitioning) {
            return Err(Error::FailedPrecondition(format!(
                "Model instance {} is {}; undeploy it before deleting",
                key, instance.state
            )));
        }

        let removed = self.remove_model_repository(key).await?;
        self.instances.delete(key).await?;

        info!("Model instance {} deleted ({} entries removed)", key, removed);

        Ok(())
    }

    /// Deletes every store entry named `{owner}#{model}#*#{instance}`
    ///
    /// Returns the number of top-level entries removed.
    pub async fn remove_model_repository(&self, key: &InstanceKey) -> Result<usize> {
        let guard = self.guard.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || remove_prefix(&guard, &key))
            .await
            .map_err(|e| Error::Internal(format!("Cleanup task failed: {}", e)))?
    }

    async fn cleanup(&self, key: &InstanceKey) {
        if let Err(e) = self.remove_model_repository(key).await {
            warn!("Failed to clean up model store for {}: {}", key, e);
        }
    }
}

fn remove_prefix(guard: &PathGuard, key: &InstanceKey) -> Result<usize> {
    let root = guard
        .root()
        .to_str()
        .ok_or_else(|| Error::InvalidPath(format!("{} is not valid UTF-8", guard.root().display())))?;

    let pattern = format!(
        "{}/{}#{}#*#{}",
        glob::Pattern::escape(root),
        glob::Pattern::escape(&key.owner_scope),
        glob::Pattern::escape(&key.model_id),
        glob::Pattern::escape(&key.instance_id)
    );

    let paths = glob::glob(&pattern)
        .map_err(|e| Error::Internal(format!("Invalid cleanup pattern {}: {}", pattern, e)))?;

    let mut removed = 0;
    for entry in paths {
        let path = entry.map_err(|e| Error::Io(e.into_error()))?;

        // Only exact canonical names of this instance
        let owned = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<CanonicalName>().ok())
            .map_or(false, |name| name.instance_key() == *key);
        if !owned {
            debug!("Leaving {} in place", path.display());
            continue;
        }

        let path = guard.validate(&path)?;
        if std::fs::symlink_metadata(&path)?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        debug!("Removed {}", path.display());
        removed += 1;
    }

    Ok(removed)
}
