//! Cache configuration, derived from the `[cache]` settings section.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_MAX_ENTRIES: usize = 256;
const DEFAULT_COLD_START_WINDOW_SECS: u64 = 30;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard ceiling on stored entries.
    pub max_entries: usize,
    /// Minimum age of the store before `cold_start` can clear.
    pub cold_start_window: Duration,
    /// Cadence of the metrics reporter.
    pub metrics_interval: Duration,
    /// Keep per-key hit/miss counters and emit one record per key.
    pub per_key_breakdown: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            cold_start_window: Duration::from_secs(DEFAULT_COLD_START_WINDOW_SECS),
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            per_key_breakdown: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries.get(),
            cold_start_window: settings.cold_start_window,
            metrics_interval: settings.metrics_interval,
            per_key_breakdown: settings.per_key_breakdown,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
