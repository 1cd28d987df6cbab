//! Cache item metadata records

use crate::key::{ItemKey, StorageKey};
use crate::pretty;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum retained access-log entries per item
///
/// The decay window makes older entries negligible for the utility estimate,
/// so the log keeps only the most recent accesses.
pub const MAX_ACCESS_LOG: usize = 256;

fn default_weight() -> f64 {
    1.0
}

/// Metadata record for a key the cache has ever observed
///
/// An item is created on the first miss that successfully computes and is
/// retained in the metadata store even after its blob is evicted. Residency is
/// signalled by `storage_key`: present means the object store holds a blob at
/// that key of exactly `size_bytes` bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    /// Primary identity: content digest of the computation's inputs
    pub item_key: ItemKey,
    /// Blob handle; `None` means not currently resident
    pub storage_key: Option<StorageKey>,
    /// Blob size on disk; 0 iff not resident
    pub size_bytes: u64,
    /// Measured wall-clock time of the last successful computation
    pub compute_cost: Duration,
    /// Timestamp of the first computation; survives refreshes and evictions
    pub created_at: DateTime<Utc>,
    /// Access timestamps, non-decreasing, capped at [`MAX_ACCESS_LOG`]
    pub access_log: Vec<DateTime<Utc>>,
    /// SHA-256 of the blob at write time, for on-demand verification
    pub blob_digest: Option<String>,
    /// Retention multiplier applied to expected savings; default 1.0
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Short human label
    pub pretty_description: String,
    /// Cached utility; invalidated on any state change, never persisted
    #[serde(skip)]
    pub last_utility: Option<f64>,
}

impl CacheItem {
    /// Create a fresh, non-resident record
    #[must_use]
    pub fn new(item_key: ItemKey, created_at: DateTime<Utc>, description: impl Into<String>) -> Self {
        Self {
            item_key,
            storage_key: None,
            size_bytes: 0,
            compute_cost: Duration::ZERO,
            created_at,
            access_log: Vec::new(),
            blob_digest: None,
            weight: 1.0,
            pretty_description: description.into(),
            last_utility: None,
        }
    }

    /// Whether the item's blob is currently expected to exist
    #[must_use]
    pub const fn is_resident(&self) -> bool {
        self.storage_key.is_some()
    }

    /// Point the record at a freshly written blob
    pub fn make_resident(&mut self, storage_key: StorageKey, size_bytes: u64, digest: String) {
        self.storage_key = Some(storage_key);
        self.size_bytes = size_bytes;
        self.blob_digest = Some(digest);
        self.last_utility = None;
    }

    /// Clear residency: no storage key, zero size
    pub fn mark_non_resident(&mut self) {
        self.storage_key = None;
        self.size_bytes = 0;
        self.blob_digest = None;
        self.last_utility = None;
    }

    /// Append an access, keeping the log monotone and capped
    ///
    /// A timestamp earlier than the latest recorded access is clamped to it so
    /// the log never decreases.
    pub fn record_access(&mut self, at: DateTime<Utc>) {
        let at = match self.access_log.last() {
            Some(last) if at < *last => *last,
            _ => at,
        };
        self.access_log.push(at);
        if self.access_log.len() > MAX_ACCESS_LOG {
            let excess = self.access_log.len() - MAX_ACCESS_LOG;
            self.access_log.drain(..excess);
        }
        self.last_utility = None;
    }

    /// Most recent access, if any
    #[must_use]
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.access_log.last().copied()
    }
}

impl fmt::Display for CacheItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: size={}, compute time={}",
            self.pretty_description,
            pretty::short_key(&self.item_key),
            pretty::human_bytes(self.size_bytes),
            pretty::human_duration(self.compute_cost),
        )?;
        if (self.weight - 1.0).abs() > f64::EPSILON {
            write!(f, ", weight={}", self.weight)?;
        }
        Ok(())
    }
}
