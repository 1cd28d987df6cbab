//! Item producers and storage-key generation
//!
//! A producer bundles everything the coordinator needs for one cacheable
//! computation: the content-addressed identity, the compute thunk, and the
//! codec pair. The coordinator never sees a raw object without knowing how to
//! persist it.

use crate::error::BoxError;
use crate::key::{ItemKey, StorageKey};

/// One cacheable computation: identity, compute, and codec in a single value
///
/// Passed by move into the coordinator's get-or-compute. Deterministic
/// producers must return equal objects for equal item keys; timeouts and
/// cancellation are the producer's responsibility.
pub trait ItemProducer {
    /// The object this producer computes
    type Item;

    /// Content digest of the computation's inputs
    fn item_key(&self) -> ItemKey;

    /// Run the computation; wall-clock time is measured around this call
    fn compute_item(&mut self) -> Result<Self::Item, BoxError>;

    /// Encode a computed object for storage
    fn serialize_item(&self, item: &Self::Item) -> Result<Vec<u8>, BoxError>;

    /// Reconstruct an object from stored bytes
    ///
    /// A refusal here is treated as a corrupt blob: the item is demoted and
    /// recomputed once.
    fn instantiate_item(&self, bytes: &[u8]) -> Result<Self::Item, BoxError>;

    /// Proposed storage key, if the producer wants to choose one
    fn propose_storage_key(&self) -> Option<StorageKey> {
        None
    }

    /// Short human label for the item's metadata record
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Derives a storage key when the producer does not propose one
pub trait StorageKeyGenerator: Send {
    /// Deterministic, collision-resistant mapping from item key to storage key
    fn derive(&self, item_key: &ItemKey) -> StorageKey;
}

/// Reference generator: prefix, full hex of the item key, extension
///
/// The full digest keeps the mapping bijective with the item key.
#[derive(Debug, Clone)]
pub struct KeyPathGenerator {
    /// Prepended verbatim; may carry a subdirectory (e.g. `"objects/"`)
    pub prefix: String,
    /// File extension without the dot
    pub extension: String,
}

impl Default for KeyPathGenerator {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            extension: "bin".to_string(),
        }
    }
}

impl StorageKeyGenerator for KeyPathGenerator {
    fn derive(&self, item_key: &ItemKey) -> StorageKey {
        StorageKey::new(format!("{}{}.{}", self.prefix, item_key.to_hex(), self.extension))
    }
}
