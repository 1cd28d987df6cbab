//! Pruning engine
//!
//! Restores the storage invariant `free_space >= reserved_free_space` while
//! retaining as much utility as possible, and repairs cross-store
//! disagreements on the way: missing blobs demote their items, size drift is
//! corrected, and orphan blobs are deleted.

use crate::config::CacheConfig;
use crate::item::CacheItem;
use crate::key::StorageKey;
use crate::store::{MetadataStore, ObjectStore};
use crate::utility::{eviction_cmp, utility};
use chrono::Utc;
use std::collections::BTreeSet;

/// Options for one prune run
#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// Clear every item's access log after eviction decisions are made
    pub remove_history: bool,
    /// Log each eviction at info level instead of debug
    pub verbose: bool,
    /// Report what would happen without touching either store
    pub dry_run: bool,
}

/// Statistics from one prune run
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Resident items inspected
    pub items_scanned: usize,
    /// Items whose metadata was corrected (missing blob or size drift)
    pub repaired: usize,
    /// Unreferenced blobs deleted from the object store
    pub orphans_removed: usize,
    /// Items evicted (blob deleted, metadata demoted)
    pub evicted: usize,
    /// Bytes reclaimed by evictions
    pub bytes_freed: u64,
    /// Items skipped because of unrepairable disagreement or delete failure
    pub skipped: usize,
    /// Wall-clock duration of the run
    pub duration_ms: u64,
}

/// Walks the resident set and evicts in ascending-utility order
///
/// Given the same snapshot and configuration, the set of evicted keys is
/// identical across runs.
pub struct PruneEngine<'a> {
    metadata: &'a dyn MetadataStore,
    objects: &'a dyn ObjectStore,
    config: &'a CacheConfig,
}

impl<'a> PruneEngine<'a> {
    /// Create an engine over the given stores and configuration
    #[must_use]
    pub fn new(
        metadata: &'a dyn MetadataStore,
        objects: &'a dyn ObjectStore,
        config: &'a CacheConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            config,
        }
    }

    /// Run a full prune
    ///
    /// # Errors
    ///
    /// Fails on metadata-store trouble; object-store trouble on individual
    /// blobs is reported in the returned [`PruneReport`] and skipped.
    pub fn run(&self, options: &PruneOptions) -> crate::error::Result<PruneReport> {
        let start = std::time::Instant::now();
        let now = Utc::now();
        let mut report = PruneReport::default();

        let snapshot = self.metadata.iter_resident()?;
        report.items_scanned = snapshot.len();

        let resident = self.repair_pass(snapshot, options, &mut report)?;
        self.orphan_sweep(&resident, options, &mut report);

        // Rank every survivor once, with a single `now`, so the eviction
        // order is a stable total order over the snapshot
        let mut ranked: Vec<(f64, CacheItem)> = resident
            .into_iter()
            .map(|mut item| {
                let score = utility(&item, self.config, now);
                item.last_utility = Some(score);
                (score, item)
            })
            .collect();
        ranked.sort_by(|a, b| eviction_cmp(a.0, &a.1, b.0, &b.1));

        // Below-threshold items form a prefix of the ranking
        let threshold = self.config.min_utility_to_keep;
        let mut simulated_freed: u64 = 0;
        let mut next = 0;
        while next < ranked.len() && ranked[next].0 < threshold {
            let (score, item) = &ranked[next];
            if self.evict(item, *score, options, &mut report) && options.dry_run {
                simulated_freed += item.size_bytes;
            }
            next += 1;
        }

        // Space-driven eviction: keep going until the reservation holds or
        // nothing is left to remove. Zero-size items free nothing and are
        // never evicted for space reasons alone.
        let reserved = self.config.reserved_free_space;
        while next < ranked.len() {
            let free = self.objects.free_space()?.saturating_add(simulated_freed);
            if free >= reserved {
                break;
            }
            let (score, item) = &ranked[next];
            next += 1;
            if item.size_bytes == 0 {
                continue;
            }
            if self.evict(item, *score, options, &mut report) && options.dry_run {
                simulated_freed += item.size_bytes;
            }
        }

        if options.remove_history && !options.dry_run {
            self.metadata.clear_access_logs()?;
        }

        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            scanned = report.items_scanned,
            repaired = report.repaired,
            orphans = report.orphans_removed,
            evicted = report.evicted,
            freed = report.bytes_freed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            dry_run = options.dry_run,
            "Prune complete"
        );
        Ok(report)
    }

    /// Verify each resident item's blob exists at the recorded size
    ///
    /// Returns the items that are still resident after repair.
    fn repair_pass(
        &self,
        snapshot: Vec<CacheItem>,
        options: &PruneOptions,
        report: &mut PruneReport,
    ) -> crate::error::Result<Vec<CacheItem>> {
        let mut resident = Vec::with_capacity(snapshot.len());
        let mut claimed = BTreeSet::new();

        for mut item in snapshot {
            let Some(storage_key) = item.storage_key.clone() else {
                continue;
            };
            if !claimed.insert(storage_key.clone()) {
                // Two items claiming one blob cannot be repaired here
                if options.verbose {
                    tracing::warn!(
                        key = %item.item_key,
                        storage_key = %storage_key,
                        "Duplicate storage key; skipping item"
                    );
                }
                report.skipped += 1;
                continue;
            }
            match self.objects.size(&storage_key) {
                Ok(Some(actual)) => {
                    if actual != item.size_bytes {
                        tracing::debug!(
                            key = %item.item_key,
                            recorded = item.size_bytes,
                            actual,
                            "Size drift; updating metadata"
                        );
                        item.size_bytes = actual;
                        item.last_utility = None;
                        if !options.dry_run {
                            self.metadata.upsert(&item)?;
                        }
                        report.repaired += 1;
                    }
                    resident.push(item);
                }
                Ok(None) => {
                    tracing::debug!(
                        key = %item.item_key,
                        storage_key = %storage_key,
                        "Blob missing; marking non-resident"
                    );
                    if !options.dry_run {
                        self.metadata.mark_non_resident(&item.item_key)?;
                    }
                    report.repaired += 1;
                }
                Err(e) => {
                    tracing::warn!(key = %item.item_key, error = %e, "Could not stat blob; skipping item");
                    report.skipped += 1;
                }
            }
        }
        Ok(resident)
    }

    /// Delete blobs no resident item claims
    fn orphan_sweep(
        &self,
        resident: &[CacheItem],
        options: &PruneOptions,
        report: &mut PruneReport,
    ) {
        let claimed: BTreeSet<&StorageKey> =
            resident.iter().filter_map(|i| i.storage_key.as_ref()).collect();

        let keys = match self.objects.iter_keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Could not enumerate blobs; skipping orphan sweep");
                report.skipped += 1;
                return;
            }
        };
        for key in keys {
            if claimed.contains(&key) {
                continue;
            }
            if options.dry_run {
                report.orphans_removed += 1;
                continue;
            }
            match self.objects.delete(&key) {
                Ok(()) => {
                    tracing::debug!(storage_key = %key, "Deleted orphan blob");
                    report.orphans_removed += 1;
                }
                Err(e) => {
                    tracing::warn!(storage_key = %key, error = %e, "Failed to delete orphan blob");
                    report.skipped += 1;
                }
            }
        }
    }

    /// Delete an item's blob, then demote its metadata
    ///
    /// Blob first, metadata second: a crash in between leaves an orphan that
    /// the next prune reaps, never a resident item without a blob. A failed
    /// blob deletion leaves the item resident and is not fatal.
    fn evict(
        &self,
        item: &CacheItem,
        score: f64,
        options: &PruneOptions,
        report: &mut PruneReport,
    ) -> bool {
        let Some(storage_key) = item.storage_key.as_ref() else {
            return false;
        };
        if options.dry_run {
            tracing::info!(item = %item, utility = score, "[dry-run] Would evict");
            report.evicted += 1;
            report.bytes_freed += item.size_bytes;
            return true;
        }
        if let Err(e) = self.objects.delete(storage_key) {
            tracing::warn!(item = %item, error = %e, "Failed to delete blob; keeping resident");
            report.skipped += 1;
            return false;
        }
        match self.metadata.mark_non_resident(&item.item_key) {
            Ok(()) => {
                if options.verbose {
                    tracing::info!(item = %item, utility = score, "Evicted");
                } else {
                    tracing::debug!(item = %item, utility = score, "Evicted");
                }
                report.evicted += 1;
                report.bytes_freed += item.size_bytes;
                true
            }
            Err(e) => {
                // Blob is gone but the record still says resident; the next
                // repair pass demotes it
                tracing::warn!(item = %item, error = %e, "Blob deleted but demotion failed");
                report.skipped += 1;
                false
            }
        }
    }
}
