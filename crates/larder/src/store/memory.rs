//! In-memory reference backends
//!
//! A mock object store with a synthetic volume capacity and a mock metadata
//! store. Used by the test suite and by embedders wanting an ephemeral cache
//! with the same semantics as the durable backends.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::item::CacheItem;
use crate::key::{ItemKey, StorageKey};
use crate::store::{MetadataStore, ObjectStore};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

/// Object store holding blobs in memory against a fixed volume capacity
///
/// Free space is the capacity minus the stored bytes, so space-driven pruning
/// behaves exactly as it would on a real volume the cache has to itself.
pub struct MemoryObjectStore {
    inner: Mutex<MemoryObjectStoreInner>,
}

struct MemoryObjectStoreInner {
    capacity: u64,
    blobs: BTreeMap<StorageKey, Vec<u8>>,
}

impl MemoryObjectStore {
    /// Create a store backed by a synthetic volume of `capacity` bytes
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(MemoryObjectStoreInner {
                capacity,
                blobs: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryObjectStoreInner> {
        // A poisoned lock means a panic mid-mutation; tests should fail loudly
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn write(&self, storage_key: &StorageKey, bytes: &[u8]) -> Result<u64> {
        let mut inner = self.lock();
        if inner.blobs.contains_key(storage_key) {
            return Err(Error::io_no_path(
                io::Error::new(io::ErrorKind::AlreadyExists, storage_key.to_string()),
                "write",
            ));
        }
        let len = bytes.len() as u64;
        inner.blobs.insert(storage_key.clone(), bytes.to_vec());
        Ok(len)
    }

    fn read(&self, storage_key: &StorageKey) -> Result<Vec<u8>> {
        self.lock().blobs.get(storage_key).cloned().ok_or_else(|| {
            Error::io_no_path(
                io::Error::new(io::ErrorKind::NotFound, storage_key.to_string()),
                "read",
            )
        })
    }

    fn delete(&self, storage_key: &StorageKey) -> Result<()> {
        self.lock().blobs.remove(storage_key);
        Ok(())
    }

    fn exists(&self, storage_key: &StorageKey) -> Result<bool> {
        Ok(self.lock().blobs.contains_key(storage_key))
    }

    fn size(&self, storage_key: &StorageKey) -> Result<Option<u64>> {
        Ok(self.lock().blobs.get(storage_key).map(|b| b.len() as u64))
    }

    fn iter_keys(&self) -> Result<Vec<StorageKey>> {
        Ok(self.lock().blobs.keys().cloned().collect())
    }

    fn free_space(&self) -> Result<u64> {
        let inner = self.lock();
        let used: u64 = inner.blobs.values().map(|b| b.len() as u64).sum();
        Ok(inner.capacity.saturating_sub(used))
    }

    fn digest(&self, storage_key: &StorageKey) -> Result<String> {
        let bytes = self.read(storage_key)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Metadata store holding records in memory
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<MemoryMetadataStoreInner>,
}

#[derive(Default)]
struct MemoryMetadataStoreInner {
    items: BTreeMap<ItemKey, CacheItem>,
    config: Option<CacheConfig>,
}

impl MemoryMetadataStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryMetadataStoreInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, item_key: &ItemKey) -> Result<Option<CacheItem>> {
        Ok(self.lock().items.get(item_key).cloned())
    }

    fn upsert(&self, item: &CacheItem) -> Result<()> {
        self.lock().items.insert(item.item_key, item.clone());
        Ok(())
    }

    fn mark_non_resident(&self, item_key: &ItemKey) -> Result<()> {
        if let Some(item) = self.lock().items.get_mut(item_key) {
            item.mark_non_resident();
        }
        Ok(())
    }

    fn iter_resident(&self) -> Result<Vec<CacheItem>> {
        Ok(self
            .lock()
            .items
            .values()
            .filter(|item| item.is_resident())
            .cloned()
            .collect())
    }

    fn append_access(&self, item_key: &ItemKey, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let item = inner
            .items
            .get_mut(item_key)
            .ok_or_else(|| Error::not_found(item_key.to_hex()))?;
        item.record_access(at);
        Ok(())
    }

    fn clear_access_logs(&self) -> Result<()> {
        for item in self.lock().items.values_mut() {
            item.access_log.clear();
            item.last_utility = None;
        }
        Ok(())
    }

    fn delete(&self, item_key: &ItemKey) -> Result<()> {
        self.lock().items.remove(item_key);
        Ok(())
    }

    fn load_config(&self) -> Result<Option<CacheConfig>> {
        Ok(self.lock().config.clone())
    }

    fn store_config(&self, config: &CacheConfig) -> Result<()> {
        self.lock().config = Some(config.clone());
        Ok(())
    }
}
