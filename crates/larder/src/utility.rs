//! Utility model
//!
//! Ranks items by desirability of retention: the expected future savings
//! (compute cost avoided, estimated from decayed access history) minus the
//! storage opportunity cost of the bytes the item occupies. The resulting
//! scalar gives a total order over items; prune evicts in ascending order.

use crate::config::CacheConfig;
use crate::item::CacheItem;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Bytes per gigabyte as used by the storage-cost exchange rate
pub const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Observation window for the access-rate estimator, in half-lives
pub const ACCESS_WINDOW_HALF_LIVES: f64 = 5.0;

/// Net utility of retaining an item, in compute-seconds per second
///
/// Pure and deterministic given its inputs. Zero compute cost yields a
/// non-positive utility regardless of size; zero size yields a utility equal
/// to the expected savings.
#[must_use]
pub fn utility(item: &CacheItem, config: &CacheConfig, now: DateTime<Utc>) -> f64 {
    let savings = access_rate(item, config, now) * item.compute_cost.as_secs_f64() * item.weight;
    savings - storage_cost_per_second(item.size_bytes, config)
}

/// Opportunity cost of holding `size_bytes`, in compute-seconds per second
///
/// One minute of compute is worth `cost_of_minute_compute_rel_to_cost_of_1gb`
/// gigabyte-seconds of storage.
#[must_use]
pub fn storage_cost_per_second(size_bytes: u64, config: &CacheConfig) -> f64 {
    size_bytes as f64 / BYTES_PER_GB / config.cost_of_minute_compute_rel_to_cost_of_1gb / 60.0
}

/// Estimated accesses per second, weighted by exponential decay
///
/// Each access at time `t` contributes `2^-((now - t) / half_life)`. The
/// observation window runs from `max(created_at, now - 5 * half_life)` to
/// `now`, clamped to at least one second so an item created at `now` still
/// gets a finite rate. An empty access log uses a prior of exactly one access
/// at `created_at`.
#[must_use]
pub fn access_rate(item: &CacheItem, config: &CacheConfig, now: DateTime<Utc>) -> f64 {
    let half_life = config.half_life_of_accesses.as_secs_f64();

    let window_secs = {
        let since_created = (now - item.created_at).as_seconds_f64();
        since_created.min(ACCESS_WINDOW_HALF_LIVES * half_life).max(1.0)
    };

    let weight_at = |t: DateTime<Utc>| -> f64 {
        let age = (now - t).as_seconds_f64().max(0.0);
        (-age / half_life).exp2()
    };

    let weighted: f64 = if item.access_log.is_empty() {
        weight_at(item.created_at)
    } else {
        item.access_log.iter().map(|t| weight_at(*t)).sum()
    };

    weighted / window_secs
}

/// Eviction order over ranked items: ascending utility, ties broken by larger
/// size first, then older `created_at` first, then lexicographic item key
///
/// Items sorting earlier are evicted earlier. The order is total, so a prune
/// over the same snapshot always removes the same keys.
#[must_use]
pub fn eviction_cmp(a_utility: f64, a: &CacheItem, b_utility: f64, b: &CacheItem) -> Ordering {
    a_utility
        .total_cmp(&b_utility)
        .then_with(|| b.size_bytes.cmp(&a.size_bytes))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.item_key.cmp(&b.item_key))
}
