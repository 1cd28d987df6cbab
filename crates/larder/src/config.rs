//! Cache configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default exchange rate: one minute of compute costs the same as holding
/// 1 GB for one minute
pub const DEFAULT_COST_OF_MINUTE_COMPUTE: f64 = 60.0;

/// Default half-life of access evidence (30 days)
pub const DEFAULT_HALF_LIFE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Tunables governing retention policy
///
/// The configuration is persisted as a single blob in the metadata store and
/// loaded once per coordinator construction. Changing it does not
/// retroactively alter recorded compute costs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Minimum free bytes the backing volume must retain after a prune
    pub reserved_free_space: u64,
    /// Exchange rate between one minute of compute time and one gigabyte of
    /// storage-seconds; higher values retain expensive items longer
    pub cost_of_minute_compute_rel_to_cost_of_1gb: f64,
    /// Time over which past-access evidence decays by half
    pub half_life_of_accesses: Duration,
    /// Items with utility strictly below this are evicted during prune
    pub min_utility_to_keep: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reserved_free_space: 0,
            cost_of_minute_compute_rel_to_cost_of_1gb: DEFAULT_COST_OF_MINUTE_COMPUTE,
            half_life_of_accesses: DEFAULT_HALF_LIFE,
            min_utility_to_keep: 0.0,
        }
    }
}

impl CacheConfig {
    /// Check all options are in range
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending option.
    pub fn validate(&self) -> Result<()> {
        let ratio = self.cost_of_minute_compute_rel_to_cost_of_1gb;
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(Error::config(format!(
                "cost_of_minute_compute_rel_to_cost_of_1gb must be finite and positive, got {ratio}"
            )));
        }
        if self.half_life_of_accesses.is_zero() {
            return Err(Error::config("half_life_of_accesses must be positive"));
        }
        if !self.min_utility_to_keep.is_finite() {
            return Err(Error::config(format!(
                "min_utility_to_keep must be finite, got {}",
                self.min_utility_to_keep
            )));
        }
        Ok(())
    }
}
