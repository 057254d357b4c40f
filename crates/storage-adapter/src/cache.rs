//! Blob cache implementation
//!
//! Operation results can exceed what a workflow engine carries in its own
//! payloads, so they travel through this store keyed by execution id.

use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use common::error::Result;

/// Key-value blob store with per-entry expiry
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Gets a blob; `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores a blob for `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Removes a blob, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process [`BlobStore`]
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    /// Entries by key
    entries: DashMap<String, Entry>,
}

impl MemoryBlobStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries and returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Purged {} expired blobs", removed);
        }
        removed
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if value.is_none() {
            trace!("Blob {} expired", key);
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }

        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        // Entries nobody reads again are dropped here
        self.purge_expired();

        trace!("Storing blob {} ({} bytes, ttl {:?})", key, value.len(), ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryBlobStore::new();
        store.set("exec-1", Bytes::from_static(b"{}"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("exec-1").await.unwrap(), Some(Bytes::from_static(b"{}")));
        assert_eq!(store.get("exec-2").await.unwrap(), None);
        assert!(store.delete("exec-1").await.unwrap());
        assert!(!store.delete("exec-1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryBlobStore::new();
        store.set("short", Bytes::from_static(b"a"), Duration::from_secs(1)).await.unwrap();
        store.set("long", Bytes::from_static(b"b"), Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.get("long").await.unwrap().is_some());
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_drops_unread_expired_entries() {
        let store = MemoryBlobStore::new();
        for i in 0..10 {
            let key = format!("exec-{}", i);
            store.set(&key, Bytes::from_static(b"{}"), Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(store.entries.len(), 10);

        tokio::time::advance(Duration::from_secs(2)).await;

        store.set("exec-next", Bytes::from_static(b"{}"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.entries.len(), 1);
        assert!(store.get("exec-next").await.unwrap().is_some());
    }
}
