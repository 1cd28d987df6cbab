//! Store interfaces consumed by the coordinator
//!
//! The coordinator depends only on these traits; the reference backends (a
//! local-volume object store, a SQLite metadata store, in-memory mocks) are
//! interchangeable. All operations are synchronous and fail with a
//! recoverable error on I/O trouble. Backends serialize internal state behind
//! a mutex so a shared coordinator needs no `&mut` plumbing; no cross-call
//! coordination beyond that is provided.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::item::CacheItem;
use crate::key::{ItemKey, StorageKey};
use chrono::{DateTime, Utc};

pub mod fs;
pub mod memory;
pub mod sqlite;

/// Durable record of every item the cache has ever seen, plus configuration
///
/// The metadata store is the authoritative record; all mutations go through
/// it. Items survive eviction (they merely lose residency) until explicitly
/// deleted.
pub trait MetadataStore: Send {
    /// Fetch one item by key
    fn get(&self, item_key: &ItemKey) -> Result<Option<CacheItem>>;

    /// Atomic replace by `item_key`, access log included
    fn upsert(&self, item: &CacheItem) -> Result<()>;

    /// Clear `storage_key` and zero `size_bytes` for one item
    fn mark_non_resident(&self, item_key: &ItemKey) -> Result<()>;

    /// Consistent snapshot of all resident items
    fn iter_resident(&self) -> Result<Vec<CacheItem>>;

    /// Append one access, keeping the log monotone and capped
    fn append_access(&self, item_key: &ItemKey, at: DateTime<Utc>) -> Result<()>;

    /// Drop the access logs of all items, resident or not
    fn clear_access_logs(&self) -> Result<()>;

    /// Remove an item's record entirely
    fn delete(&self, item_key: &ItemKey) -> Result<()>;

    /// Load the persisted configuration blob, if one was ever stored
    fn load_config(&self) -> Result<Option<CacheConfig>>;

    /// Persist the configuration blob
    fn store_config(&self, config: &CacheConfig) -> Result<()>;
}

/// Content-indexed blob repository addressed by storage key
pub trait ObjectStore: Send {
    /// Store a blob atomically; overwriting an existing key is an error
    ///
    /// Returns the stored size in bytes. No partial blob remains visible on
    /// failure.
    fn write(&self, storage_key: &StorageKey, bytes: &[u8]) -> Result<u64>;

    /// Read a blob in full
    fn read(&self, storage_key: &StorageKey) -> Result<Vec<u8>>;

    /// Delete a blob; deleting a missing key is not an error
    fn delete(&self, storage_key: &StorageKey) -> Result<()>;

    /// Whether a blob exists at the key
    fn exists(&self, storage_key: &StorageKey) -> Result<bool>;

    /// On-disk size of the blob, or `None` if absent
    fn size(&self, storage_key: &StorageKey) -> Result<Option<u64>>;

    /// Enumerate every blob currently stored
    fn iter_keys(&self) -> Result<Vec<StorageKey>>;

    /// Free bytes on the backing volume; advisory, may change at any time
    fn free_space(&self) -> Result<u64>;

    /// SHA-256 of the blob's current contents, hex encoded
    fn digest(&self, storage_key: &StorageKey) -> Result<String>;
}
