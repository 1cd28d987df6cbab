//! Persistent object cache for results of expensive, pure computations
//!
//! Given a content-addressed key derived from a computation's inputs, the
//! cache either returns a previously stored result or invokes a
//! caller-supplied producer to compute, serialize, and store it. Every item
//! carries metadata (size on disk, measured compute cost, access history),
//! and a prune pass evicts items whose expected future value no longer
//! justifies the storage they occupy.
//!
//! # Overview
//!
//! - [`ObjectCache`]: the coordinator exposing get-or-compute, lookup,
//!   forced refresh, forget, and prune
//! - [`utility`]: the retention policy, decayed access-rate savings minus
//!   storage opportunity cost
//! - [`PruneEngine`]: cross-store repair, orphan reaping, and
//!   ascending-utility eviction until the free-space reservation holds
//! - [`MetadataStore`] / [`ObjectStore`]: the seams for backends, with a
//!   SQLite + local-filesystem pair and in-memory mocks provided
//!
//! # Example
//!
//! ```no_run
//! use larder::{ItemKey, ItemProducer, ObjectCache};
//!
//! struct Squares;
//!
//! impl ItemProducer for Squares {
//!     type Item = Vec<u64>;
//!
//!     fn item_key(&self) -> ItemKey {
//!         ItemKey::hash_bytes(b"squares-to-1000")
//!     }
//!
//!     fn compute_item(&mut self) -> Result<Self::Item, larder::BoxError> {
//!         Ok((0..1000).map(|n| n * n).collect())
//!     }
//!
//!     fn serialize_item(&self, item: &Self::Item) -> Result<Vec<u8>, larder::BoxError> {
//!         Ok(serde_json::to_vec(item)?)
//!     }
//!
//!     fn instantiate_item(&self, bytes: &[u8]) -> Result<Self::Item, larder::BoxError> {
//!         Ok(serde_json::from_slice(bytes)?)
//!     }
//! }
//!
//! # fn main() -> Result<(), larder::Error> {
//! let cache = ObjectCache::open_local("/var/cache/squares")?;
//! let squares = cache.get_object(Squares)?; // computed once, served from disk after
//! cache.prune_cache(false, false)?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod error;
mod item;
mod key;
pub mod pretty;
mod producer;
mod prune;
pub mod store;
pub mod utility;

pub use cache::{METADATA_DB_FILE, ObjectCache};
pub use config::{CacheConfig, DEFAULT_COST_OF_MINUTE_COMPUTE, DEFAULT_HALF_LIFE};
pub use error::{BoxError, Error, Result};
pub use item::{CacheItem, MAX_ACCESS_LOG};
pub use key::{ItemKey, StorageKey};
pub use producer::{ItemProducer, KeyPathGenerator, StorageKeyGenerator};
pub use prune::{PruneEngine, PruneOptions, PruneReport};
pub use store::fs::FsObjectStore;
pub use store::memory::{MemoryMetadataStore, MemoryObjectStore};
pub use store::sqlite::SqliteMetadataStore;
pub use store::{MetadataStore, ObjectStore};
