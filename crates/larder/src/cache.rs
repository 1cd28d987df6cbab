//! Cache coordinator
//!
//! The public surface of the cache: get-or-compute, metadata lookup, forced
//! refresh, forget, and prune. The coordinator links a metadata store, an
//! object store, and caller-supplied producers into one protocol and enforces
//! the cross-store invariants:
//! - a resident item's blob exists at its storage key
//! - every blob belongs to exactly one item
//! - a failing operation leaves both stores consistent
//!
//! Repair on the hot path is limited to what a single item needs (a missing
//! or corrupt blob triggers one recompute); full reconciliation is prune's
//! job.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::item::CacheItem;
use crate::key::{ItemKey, StorageKey};
use crate::producer::{ItemProducer, KeyPathGenerator, StorageKeyGenerator};
use crate::prune::{PruneEngine, PruneOptions, PruneReport};
use crate::store::fs::FsObjectStore;
use crate::store::memory::{MemoryMetadataStore, MemoryObjectStore};
use crate::store::sqlite::SqliteMetadataStore;
use crate::store::{MetadataStore, ObjectStore};
use crate::{pretty, utility};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Instant;

/// Conventional file name of the metadata database inside a cache directory
///
/// Dot-named so the filesystem object store never mistakes it for a blob.
pub const METADATA_DB_FILE: &str = ".metadata.sqlite";

/// Persistent object cache coordinator
///
/// Operations are sequential: callers issuing them one at a time observe
/// strictly sequential effects. Concurrent callers on the same key may both
/// compute (at-least-one-compute, not at-most-one).
pub struct ObjectCache {
    metadata: Box<dyn MetadataStore>,
    objects: Box<dyn ObjectStore>,
    keygen: Box<dyn StorageKeyGenerator>,
    config: CacheConfig,
}

impl ObjectCache {
    /// Assemble a cache from store implementations, loading persisted config
    ///
    /// A configuration blob already in the metadata store wins; otherwise the
    /// defaults are persisted.
    pub fn new(
        metadata: Box<dyn MetadataStore>,
        objects: Box<dyn ObjectStore>,
        keygen: Box<dyn StorageKeyGenerator>,
    ) -> Result<Self> {
        let config = match metadata.load_config()? {
            Some(config) => {
                config.validate()?;
                config
            }
            None => {
                let config = CacheConfig::default();
                metadata.store_config(&config)?;
                config
            }
        };
        Ok(Self {
            metadata,
            objects,
            keygen,
            config,
        })
    }

    /// Assemble a cache with an explicit configuration, persisting it
    pub fn with_config(
        metadata: Box<dyn MetadataStore>,
        objects: Box<dyn ObjectStore>,
        keygen: Box<dyn StorageKeyGenerator>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        metadata.store_config(&config)?;
        Ok(Self {
            metadata,
            objects,
            keygen,
            config,
        })
    }

    /// Open a cache over one local directory
    ///
    /// Blobs live directly in the directory; metadata lives in a colocated
    /// [`METADATA_DB_FILE`] database.
    pub fn open_local(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref();
        let objects = FsObjectStore::open(cache_dir)?;
        let metadata = SqliteMetadataStore::open(cache_dir.join(METADATA_DB_FILE))?;
        Self::new(
            Box::new(metadata),
            Box::new(objects),
            Box::new(KeyPathGenerator::default()),
        )
    }

    /// Open an ephemeral cache against a synthetic volume of `capacity` bytes
    pub fn open_in_memory(capacity: u64, config: CacheConfig) -> Result<Self> {
        Self::with_config(
            Box::new(MemoryMetadataStore::new()),
            Box::new(MemoryObjectStore::new(capacity)),
            Box::new(KeyPathGenerator::default()),
            config,
        )
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Validate, persist, and adopt a new configuration
    ///
    /// Recorded compute costs and sizes are not retroactively altered.
    pub fn set_config(&mut self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        self.metadata.store_config(&config)?;
        self.config = config;
        Ok(())
    }

    /// Free bytes on the object store's backing volume; advisory
    pub fn free_space(&self) -> Result<u64> {
        self.objects.free_space()
    }

    /// Return the producer's object, from cache or by computing it
    ///
    /// On a hit the blob is read and deserialized and the access is recorded.
    /// On a miss (or when the resident blob turns out missing or corrupt) the
    /// producer computes, the result is stored, and metadata is recorded with
    /// the measured wall-clock cost.
    pub fn get_object<P: ItemProducer>(&self, producer: P) -> Result<P::Item> {
        self.get_object_weighted(producer, 1.0)
    }

    /// [`get_object`](Self::get_object) with a retention weight
    ///
    /// The weight multiplies the item's expected savings in the utility
    /// model; values above 1.0 keep the item longer.
    pub fn get_object_weighted<P: ItemProducer>(
        &self,
        mut producer: P,
        weight: f64,
    ) -> Result<P::Item> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(Error::config(format!(
                "item weight must be finite and positive, got {weight}"
            )));
        }
        let item_key = producer.item_key();

        if let Some(item) = self.metadata.get(&item_key)?
            && let Some(storage_key) = &item.storage_key
        {
            match self.objects.read(storage_key) {
                Ok(bytes) => match producer.instantiate_item(&bytes) {
                    Ok(object) => {
                        tracing::debug!(key = %item_key, "Cache hit");
                        self.metadata.append_access(&item_key, Utc::now())?;
                        return Ok(object);
                    }
                    Err(e) => {
                        // Recovered once: demote and recompute. A failure in
                        // the compute path below surfaces as a producer error.
                        let corrupt = Error::corrupt_blob(item_key.to_hex(), e.to_string());
                        tracing::warn!(error = %corrupt, "Demoting and recomputing");
                        let _ = self.objects.delete(storage_key);
                        self.metadata.mark_non_resident(&item_key)?;
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        key = %item_key,
                        error = %e,
                        "Resident blob unreadable; demoting and recomputing"
                    );
                    self.metadata.mark_non_resident(&item_key)?;
                }
            }
        } else {
            tracing::debug!(key = %item_key, "Cache miss");
        }

        let (object, _) = self.compute_and_store(&mut producer, Some(weight))?;
        Ok(object)
    }

    /// Metadata record for a key, without recording an access
    pub fn get_object_info(&self, item_key: &ItemKey) -> Result<Option<CacheItem>> {
        self.metadata.get(item_key)
    }

    /// Force recomputation and storage, even if resident
    ///
    /// The replacement is atomic from the cache's point of view: the new blob
    /// is written under a fresh storage key, metadata is repointed, and only
    /// then is the old blob deleted. `created_at` and the item's weight are
    /// preserved.
    pub fn add_item_unconditionally<P: ItemProducer>(&self, mut producer: P) -> Result<CacheItem> {
        let (_, item) = self.compute_and_store(&mut producer, None)?;
        Ok(item)
    }

    /// Prune the cache; see [`PruneEngine`]
    pub fn prune_cache(&self, remove_history: bool, verbose: bool) -> Result<PruneReport> {
        self.prune_with(&PruneOptions {
            remove_history,
            verbose,
            dry_run: false,
        })
    }

    /// Prune with full options (including dry-run)
    pub fn prune_with(&self, options: &PruneOptions) -> Result<PruneReport> {
        PruneEngine::new(self.metadata.as_ref(), self.objects.as_ref(), &self.config).run(options)
    }

    /// Delete an item's blob (if resident) and erase its record entirely
    pub fn forget(&self, item_key: &ItemKey) -> Result<()> {
        let item = self
            .metadata
            .get(item_key)?
            .ok_or_else(|| Error::not_found(item_key.to_hex()))?;
        if let Some(storage_key) = &item.storage_key {
            self.objects.delete(storage_key)?;
        }
        self.metadata.delete(item_key)?;
        tracing::debug!(key = %item_key, "Forgot item");
        Ok(())
    }

    /// Check a resident item's blob against its recorded digest
    ///
    /// Returns `false` when the item is non-resident, the blob is missing, or
    /// the digest diverges. Items stored without a digest pass.
    pub fn verify_object(&self, item_key: &ItemKey) -> Result<bool> {
        let item = self
            .metadata
            .get(item_key)?
            .ok_or_else(|| Error::not_found(item_key.to_hex()))?;
        let Some(storage_key) = &item.storage_key else {
            return Ok(false);
        };
        if !self.objects.exists(storage_key)? {
            return Ok(false);
        }
        match &item.blob_digest {
            Some(expected) => Ok(self.objects.digest(storage_key)? == *expected),
            None => Ok(true),
        }
    }

    /// Snapshot of resident items, each with its current utility filled in
    pub fn items(&self) -> Result<Vec<CacheItem>> {
        let now = Utc::now();
        let mut items = self.metadata.iter_resident()?;
        for item in &mut items {
            item.last_utility = Some(utility::utility(item, &self.config, now));
        }
        Ok(items)
    }

    /// Current utility of one item, or `None` if the key was never seen
    pub fn utility_of(&self, item_key: &ItemKey) -> Result<Option<f64>> {
        let item = self.metadata.get(item_key)?;
        Ok(item.map(|item| utility::utility(&item, &self.config, Utc::now())))
    }

    /// Compute, serialize, store, and record one item
    ///
    /// `weight: Some(w)` adopts the caller's weight; `None` preserves the
    /// recorded one (forced refresh). Failure semantics: compute/serialize
    /// failures change nothing; a metadata failure after the blob write
    /// deletes the blob before surfacing.
    fn compute_and_store<P: ItemProducer>(
        &self,
        producer: &mut P,
        weight: Option<f64>,
    ) -> Result<(P::Item, CacheItem)> {
        let item_key = producer.item_key();
        let now = Utc::now();

        let started = Instant::now();
        let object = producer
            .compute_item()
            .map_err(|e| Error::producer("compute", e))?;
        let compute_cost = started.elapsed();
        let bytes = producer
            .serialize_item(&object)
            .map_err(|e| Error::producer("serialize", e))?;

        // Fetched after compute: the record may have changed while a slow
        // producer ran
        let existing = self.metadata.get(&item_key)?;
        let old_storage = existing.as_ref().and_then(|i| i.storage_key.clone());

        let base = producer
            .propose_storage_key()
            .unwrap_or_else(|| self.keygen.derive(&item_key));
        let storage_key = match &old_storage {
            Some(old) => self.vacant_refresh_key(&base, old)?,
            None => {
                if self.objects.exists(&base)? {
                    // Stale blob from a crashed write; nothing claims it
                    self.objects.delete(&base)?;
                }
                base
            }
        };

        let size_bytes = self.objects.write(&storage_key, &bytes)?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let mut item = existing.unwrap_or_else(|| {
            let description = producer
                .describe()
                .unwrap_or_else(|| pretty::short_key(&item_key));
            CacheItem::new(item_key, now, description)
        });
        if let Some(weight) = weight {
            item.weight = weight;
        }
        item.compute_cost = compute_cost;
        item.make_resident(storage_key.clone(), size_bytes, digest);
        item.record_access(now);

        if let Err(e) = self.metadata.upsert(&item) {
            // No orphan on the happy path: take the fresh blob back out
            let _ = self.objects.delete(&storage_key);
            return Err(e);
        }

        if let Some(old) = &old_storage
            && *old != storage_key
            && let Err(e) = self.objects.delete(old)
        {
            // The replaced blob is unreferenced now; prune will reap it
            tracing::warn!(key = %item_key, storage_key = %old, error = %e, "Failed to delete replaced blob");
        }

        tracing::debug!(
            key = %item_key,
            storage_key = %storage_key,
            size = size_bytes,
            cost_ms = u64::try_from(compute_cost.as_millis()).unwrap_or(u64::MAX),
            "Stored computed item"
        );
        Ok((object, item))
    }

    /// First storage key usable for a refresh: not the live blob's key and
    /// not occupied in the object store
    fn vacant_refresh_key(&self, base: &StorageKey, old: &StorageKey) -> Result<StorageKey> {
        if base != old && !self.objects.exists(base)? {
            return Ok(base.clone());
        }
        for generation in 1u32.. {
            let candidate = generation_key(base, generation);
            if &candidate != old && !self.objects.exists(&candidate)? {
                return Ok(candidate);
            }
        }
        unreachable!("an unoccupied generation key always exists")
    }
}

/// Sibling of `base` tagged with a generation counter, extension preserved
fn generation_key(base: &StorageKey, generation: u32) -> StorageKey {
    let s = base.as_str();
    match s.rsplit_once('.') {
        Some((stem, ext)) => StorageKey::new(format!("{stem}-r{generation}.{ext}")),
        None => StorageKey::new(format!("{s}-r{generation}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Producer computing a fixed byte payload, with switchable failures
    struct BytesProducer {
        seed: &'static [u8],
        payload: Vec<u8>,
        computes: Arc<AtomicUsize>,
        fail_compute: bool,
        fail_serialize: bool,
        refuse_instantiate: Arc<AtomicBool>,
    }

    impl BytesProducer {
        fn new(seed: &'static [u8], payload: &[u8]) -> Self {
            Self {
                seed,
                payload: payload.to_vec(),
                computes: Arc::new(AtomicUsize::new(0)),
                fail_compute: false,
                fail_serialize: false,
                refuse_instantiate: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl ItemProducer for BytesProducer {
        type Item = Vec<u8>;

        fn item_key(&self) -> ItemKey {
            ItemKey::hash_bytes(self.seed)
        }

        fn compute_item(&mut self) -> std::result::Result<Self::Item, BoxError> {
            self.computes.fetch_add(1, Ordering::SeqCst);
            if self.fail_compute {
                return Err(Box::new(io::Error::other("compute exploded")));
            }
            Ok(self.payload.clone())
        }

        fn serialize_item(&self, item: &Self::Item) -> std::result::Result<Vec<u8>, BoxError> {
            if self.fail_serialize {
                return Err(Box::new(io::Error::other("serialize exploded")));
            }
            Ok(item.clone())
        }

        fn instantiate_item(&self, bytes: &[u8]) -> std::result::Result<Self::Item, BoxError> {
            if self.refuse_instantiate.load(Ordering::SeqCst) {
                return Err(Box::new(io::Error::other("bytes rejected")));
            }
            Ok(bytes.to_vec())
        }
    }

    fn cache() -> ObjectCache {
        ObjectCache::open_in_memory(1_000_000, CacheConfig::default()).unwrap()
    }

    #[test]
    fn miss_then_hit_computes_once() {
        let cache = cache();
        let producer = BytesProducer::new(b"mth", b"xyz");
        let computes = producer.computes.clone();
        let key = producer.item_key();

        assert_eq!(cache.get_object(producer).unwrap(), b"xyz");
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        let second = BytesProducer::new(b"mth", b"xyz");
        let second_computes = second.computes.clone();
        assert_eq!(cache.get_object(second).unwrap(), b"xyz");
        assert_eq!(second_computes.load(Ordering::SeqCst), 0);

        let info = cache.get_object_info(&key).unwrap().unwrap();
        assert_eq!(info.access_log.len(), 2);
        assert!(info.is_resident());
    }

    #[test]
    fn info_lookup_does_not_record_an_access() {
        let cache = cache();
        let producer = BytesProducer::new(b"info", b"v");
        let key = producer.item_key();
        cache.get_object(producer).unwrap();

        cache.get_object_info(&key).unwrap();
        cache.get_object_info(&key).unwrap();
        let info = cache.get_object_info(&key).unwrap().unwrap();
        assert_eq!(info.access_log.len(), 1);

        assert!(cache.get_object_info(&ItemKey::hash_bytes(b"never")).unwrap().is_none());
    }

    #[test]
    fn compute_failure_leaves_no_trace() {
        let cache = cache();
        let mut producer = BytesProducer::new(b"boom", b"x");
        producer.fail_compute = true;
        let key = producer.item_key();

        let err = cache.get_object(producer).unwrap_err();
        assert!(matches!(err, Error::Producer { stage: "compute", .. }));
        assert!(cache.get_object_info(&key).unwrap().is_none());
        assert!(cache.items().unwrap().is_empty());
    }

    #[test]
    fn serialize_failure_leaves_no_trace() {
        let cache = cache();
        let mut producer = BytesProducer::new(b"serfail", b"x");
        producer.fail_serialize = true;
        let key = producer.item_key();

        let err = cache.get_object(producer).unwrap_err();
        assert!(matches!(err, Error::Producer { stage: "serialize", .. }));
        assert!(cache.get_object_info(&key).unwrap().is_none());
    }

    #[test]
    fn corrupt_blob_triggers_exactly_one_recompute() {
        let cache = cache();
        let producer = BytesProducer::new(b"corrupt", b"good");
        let key = producer.item_key();
        cache.get_object(producer).unwrap();

        let mut second = BytesProducer::new(b"corrupt", b"fresh");
        second.refuse_instantiate = Arc::new(AtomicBool::new(true));
        let computes = second.computes.clone();
        // Deserialization refuses the stored bytes, so the producer runs
        // again and its fresh result is returned
        let result = cache.get_object(second).unwrap();
        assert_eq!(result, b"fresh");
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        let info = cache.get_object_info(&key).unwrap().unwrap();
        assert!(info.is_resident());
        assert!(cache.verify_object(&key).unwrap());
    }

    #[test]
    fn missing_blob_is_recomputed_and_created_at_preserved() {
        let cache = cache();
        let producer = BytesProducer::new(b"vanish", b"v1");
        let key = producer.item_key();
        cache.get_object(producer).unwrap();
        let before = cache.get_object_info(&key).unwrap().unwrap();

        // External actor deletes the blob; get_object must self-heal without
        // waiting for a prune
        let storage_key = before.storage_key.clone().unwrap();
        cache.objects.delete(&storage_key).unwrap();

        let again = BytesProducer::new(b"vanish", b"v2");
        let computes = again.computes.clone();
        assert_eq!(cache.get_object(again).unwrap(), b"v2");
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        let after = cache.get_object_info(&key).unwrap().unwrap();
        assert!(after.is_resident());
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn forced_refresh_replaces_blob_and_preserves_created_at() {
        let cache = cache();
        let producer = BytesProducer::new(b"refresh", b"old");
        let key = producer.item_key();
        cache.get_object(producer).unwrap();
        let before = cache.get_object_info(&key).unwrap().unwrap();
        let old_storage = before.storage_key.clone().unwrap();

        let refreshed = cache
            .add_item_unconditionally(BytesProducer::new(b"refresh", b"new"))
            .unwrap();
        assert_eq!(refreshed.created_at, before.created_at);
        let new_storage = refreshed.storage_key.clone().unwrap();
        assert_ne!(new_storage, old_storage);
        assert!(!cache.objects.exists(&old_storage).unwrap());

        // The fresh bytes are served on the next get
        let reader = BytesProducer::new(b"refresh", b"unused");
        assert_eq!(cache.get_object(reader).unwrap(), b"new");
    }

    #[test]
    fn forget_erases_blob_and_record() {
        let cache = cache();
        let producer = BytesProducer::new(b"forget", b"x");
        let key = producer.item_key();
        cache.get_object(producer).unwrap();
        let storage_key = cache
            .get_object_info(&key)
            .unwrap()
            .unwrap()
            .storage_key
            .unwrap();

        cache.forget(&key).unwrap();
        assert!(cache.get_object_info(&key).unwrap().is_none());
        assert!(!cache.objects.exists(&storage_key).unwrap());

        assert!(matches!(cache.forget(&key), Err(Error::NotFound { .. })));
    }

    #[test]
    fn verify_object_detects_divergence() {
        let cache = cache();
        let producer = BytesProducer::new(b"verify", b"payload");
        let key = producer.item_key();
        cache.get_object(producer).unwrap();
        assert!(cache.verify_object(&key).unwrap());

        // Swap the blob behind the cache's back
        let storage_key = cache
            .get_object_info(&key)
            .unwrap()
            .unwrap()
            .storage_key
            .unwrap();
        cache.objects.delete(&storage_key).unwrap();
        cache.objects.write(&storage_key, b"tampered").unwrap();
        assert!(!cache.verify_object(&key).unwrap());
    }

    #[test]
    fn weight_is_adopted_and_preserved_across_refresh() {
        let cache = cache();
        let producer = BytesProducer::new(b"weighty", b"x");
        let key = producer.item_key();
        cache.get_object_weighted(producer, 4.0).unwrap();
        assert_eq!(cache.get_object_info(&key).unwrap().unwrap().weight, 4.0);

        cache
            .add_item_unconditionally(BytesProducer::new(b"weighty", b"y"))
            .unwrap();
        assert_eq!(cache.get_object_info(&key).unwrap().unwrap().weight, 4.0);
    }

    #[test]
    fn invalid_weight_is_refused_before_compute() {
        let cache = cache();
        let producer = BytesProducer::new(b"badweight", b"x");
        let computes = producer.computes.clone();
        assert!(matches!(
            cache.get_object_weighted(producer, 0.0),
            Err(Error::Config { .. })
        ));
        assert_eq!(computes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_is_loaded_from_the_metadata_store() {
        let metadata = MemoryMetadataStore::new();
        let stored = CacheConfig {
            reserved_free_space: 123,
            ..CacheConfig::default()
        };
        metadata.store_config(&stored).unwrap();

        let cache = ObjectCache::new(
            Box::new(metadata),
            Box::new(MemoryObjectStore::new(1000)),
            Box::new(KeyPathGenerator::default()),
        )
        .unwrap();
        assert_eq!(cache.config().reserved_free_space, 123);
    }

    #[test]
    fn set_config_validates_and_persists() {
        let mut cache = cache();
        let bad = CacheConfig {
            cost_of_minute_compute_rel_to_cost_of_1gb: -1.0,
            ..CacheConfig::default()
        };
        assert!(cache.set_config(bad).is_err());

        let good = CacheConfig {
            reserved_free_space: 55,
            ..CacheConfig::default()
        };
        cache.set_config(good).unwrap();
        assert_eq!(cache.config().reserved_free_space, 55);
        assert_eq!(
            cache.metadata.load_config().unwrap().unwrap().reserved_free_space,
            55
        );
    }

    #[test]
    fn generation_key_preserves_extension() {
        let base = StorageKey::new("abc.bin");
        assert_eq!(generation_key(&base, 1).as_str(), "abc-r1.bin");
        assert_eq!(generation_key(&base, 2).as_str(), "abc-r2.bin");
        let bare = StorageKey::new("abc");
        assert_eq!(generation_key(&bare, 1).as_str(), "abc-r1");
    }
}
