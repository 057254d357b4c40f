//! Model instance records
//!
//! The deployment state of an instance is read and written through an
//! [`InstanceStore`]; nothing else in the workspace keeps it.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use common::error::{Error, Result};
use common::models::{DeploymentState, ModelInstance};
use common::types::InstanceKey;

/// Persistence of [`ModelInstance`] records
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Gets a record; `NotFound` if absent
    async fn get(&self, key: &InstanceKey) -> Result<ModelInstance>;

    /// Inserts a new record; `AlreadyExists` if present
    async fn insert(&self, instance: ModelInstance) -> Result<()>;

    /// Replaces an existing record; `NotFound` if absent
    async fn put(&self, instance: ModelInstance) -> Result<()>;

    /// Deletes a record, returning whether it existed
    async fn delete(&self, key: &InstanceKey) -> Result<bool>;

    /// All records
    async fn list(&self) -> Result<Vec<ModelInstance>>;

    /// Sets the deployment state of a record and returns the updated record
    async fn update_state(
        &self,
        key: &InstanceKey,
        state: DeploymentState,
        error: Option<String>,
    ) -> Result<ModelInstance> {
        let mut instance = self.get(key).await?;
        instance.set_state(state);
        if state == DeploymentState::Error {
            instance.last_error = error;
        }
        self.put(instance.clone()).await?;
        Ok(instance)
    }
}

fn not_found(key: &InstanceKey) -> Error {
    Error::NotFound(format!("Model instance not found: {}", key))
}

/// In-process [`InstanceStore`]
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    /// Records by record key
    records: DashMap<String, ModelInstance>,
}

impl MemoryInstanceStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get(&self, key: &InstanceKey) -> Result<ModelInstance> {
        self.records
            .get(&key.record_key())
            .map(|r| r.value().clone())
            .ok_or_else(|| not_found(key))
    }

    async fn insert(&self, instance: ModelInstance) -> Result<()> {
        match self.records.entry(instance.key.record_key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AlreadyExists(format!(
                "Model instance already exists: {}",
                instance.key
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(instance);
                Ok(())
            }
        }
    }

    async fn put(&self, instance: ModelInstance) -> Result<()> {
        match self.records.get_mut(&instance.key.record_key()) {
            Some(mut record) => {
                *record = instance;
                Ok(())
            }
            None => Err(not_found(&instance.key)),
        }
    }

    async fn delete(&self, key: &InstanceKey) -> Result<bool> {
        Ok(self.records.remove(&key.record_key()).is_some())
    }

    async fn list(&self) -> Result<Vec<ModelInstance>> {
        let mut instances: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        instances.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(instances)
    }
}

/// [`InstanceStore`] keeping one JSON file per record
///
/// Writes go to a sibling temp file that is renamed over the record, so a
/// reader never sees a half-written record.
#[derive(Debug, Clone)]
pub struct FileInstanceStore {
    /// Directory holding `{record_key}.json` files
    dir: PathBuf,
}

impl FileInstanceStore {
    /// Creates a store in `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &InstanceKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.record_key()))
    }

    async fn write(&self, instance: &ModelInstance) -> Result<()> {
        let path = self.record_path(&instance.key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(instance)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Wrote instance record {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn get(&self, key: &InstanceKey) -> Result<ModelInstance> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, instance: ModelInstance) -> Result<()> {
        // Reserve the record name first so concurrent inserts of one key fail
        let path = self.record_path(&instance.key);
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!(
                    "Model instance already exists: {}",
                    instance.key
                )));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.write(&instance).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(())
    }

    async fn put(&self, instance: ModelInstance) -> Result<()> {
        if !tokio::fs::try_exists(self.record_path(&instance.key)).await? {
            return Err(not_found(&instance.key));
        }
        self.write(&instance).await
    }

    async fn delete(&self, key: &InstanceKey) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ModelInstance>> {
        let mut instances = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ModelInstance>(&bytes) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping unreadable instance record {}: {}", path.display(), e),
            }
        }

        instances.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(instances)
    }
}
