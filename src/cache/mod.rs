//! Resolution-aware series cache.
//!
//! - [`CacheStore`]: bounded LRU map from [`CacheKey`] to the last fetched
//!   series, expiring entries lazily once their bucket width has elapsed.
//! - [`CacheMetrics`]: samples store counters and emits them to a sink on a
//!   fixed interval, flagging the cold-start window of a fresh process.
//!
//! One store is created per process and shared by every session; nothing is
//! coordinated across instances.

mod config;
mod keys;
mod metrics;
mod store;

pub use config::CacheConfig;
pub use keys::CacheKey;
pub use metrics::{CacheMetrics, MetricsRecord, hit_rate};
pub use store::{CacheEntry, CacheStats, CacheStore, KeyStats};
