//! Bounded series store with bucket-width expiry.

use std::sync::Arc;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use bucketcast_wire::TimeBucketSeries;
use dashmap::DashMap;
use lru::LruCache;
use metrics::{counter, gauge};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::domain::resolution;

use super::config::CacheConfig;
use super::keys::CacheKey;

const SOURCE: &str = "bucketcast::cache::store";

pub(crate) const METRIC_CACHE_HIT: &str = "bucketcast_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "bucketcast_cache_miss_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "bucketcast_cache_evict_total";
pub(crate) const METRIC_CACHE_EXPIRE: &str = "bucketcast_cache_expire_total";
pub(crate) const METRIC_CACHE_ENTRIES: &str = "bucketcast_cache_entries";

/// A stored series and its lifetime.
///
/// `expires_at` is always `created_at + ttl(resolution)`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<TimeBucketSeries>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub last_accessed: OffsetDateTime,
}

impl CacheEntry {
    fn new(data: Arc<TimeBucketSeries>, now: OffsetDateTime, ttl: Duration) -> Self {
        Self {
            data,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
        }
    }

    fn touch(&mut self, now: OffsetDateTime) {
        self.last_accessed = now;
    }

    fn refresh(&mut self, data: Arc<TimeBucketSeries>, now: OffsetDateTime, ttl: Duration) {
        *self = Self::new(data, now, ttl);
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Aggregate counters. Monotonic for the life of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub current_entries: usize,
    pub evictions: u64,
    pub expirations: u64,
}

/// Counters for a single key, kept only when per-key breakdown is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Clone, Copy)]
enum Outcome {
    Hit,
    Miss,
    Expired,
    Evicted,
}

/// Process-wide cache of upstream series keyed by subject and resolution.
///
/// Capacity is enforced on insert: a new key arriving at `max_entries` first
/// evicts the entry with the oldest `last_accessed` (ties: oldest
/// `created_at`). Refreshing an existing key never evicts.
pub struct CacheStore {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    per_key: Option<DashMap<CacheKey, KeyStats>>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            max_entries: config.max_entries_non_zero().get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            per_key: config.per_key_breakdown.then(DashMap::new),
        }
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self::new(&CacheConfig {
            max_entries,
            ..CacheConfig::default()
        })
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Look up `key` at business time `now`.
    ///
    /// An entry whose expiry has been reached is dropped and reported as a
    /// miss. A hit promotes the entry to most recently used.
    pub fn get(&self, key: &CacheKey, now: OffsetDateTime) -> Option<Arc<TimeBucketSeries>> {
        let mut entries = self.lock("get");

        match entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => {
                drop(entries);
                self.count(key, Outcome::Miss);
                return None;
            }
            Some(true) => {
                entries.pop(key);
                let len = entries.len();
                drop(entries);
                debug!(target = SOURCE, key = %key, "expired cache entry dropped");
                self.count(key, Outcome::Expired);
                self.count(key, Outcome::Miss);
                gauge!(METRIC_CACHE_ENTRIES).set(len as f64);
                return None;
            }
            Some(false) => {}
        }

        let data = entries.get_mut(key).map(|entry| {
            entry.touch(now);
            Arc::clone(&entry.data)
        });
        drop(entries);
        self.count(key, Outcome::Hit);
        data
    }

    /// Store freshly fetched `data` for `key`, valid for one bucket width.
    pub fn set(&self, key: CacheKey, data: Arc<TimeBucketSeries>, now: OffsetDateTime) {
        let ttl = resolution::ttl(key.resolution);
        let mut entries = self.lock("set");

        if let Some(entry) = entries.get_mut(&key) {
            entry.refresh(data, now, ttl);
            return;
        }

        let victim = if entries.len() >= self.max_entries {
            Self::select_victim(&entries)
        } else {
            None
        };
        if let Some(victim) = &victim {
            entries.pop(victim);
        }

        entries.put(key, CacheEntry::new(data, now, ttl));
        let len = entries.len();
        drop(entries);

        if let Some(victim) = victim {
            debug!(target = SOURCE, key = %victim, "evicted least recently used entry");
            self.count(&victim, Outcome::Evicted);
        }
        gauge!(METRIC_CACHE_ENTRIES).set(len as f64);
    }

    /// Oldest `last_accessed`, then oldest `created_at`, then least recent
    /// in promotion order.
    fn select_victim(entries: &LruCache<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .rev()
            .min_by_key(|(_, entry)| (entry.last_accessed, entry.created_at))
            .map(|(key, _)| key.clone())
    }

    /// Whether `key` is currently stored, without touching recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock("contains").contains(key)
    }

    /// Entry metadata without promoting it.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock("peek").peek(key).cloned()
    }

    pub fn size(&self) -> usize {
        self.lock("size").len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            current_entries: self.size(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Per-key counters sorted by key; empty when breakdown is disabled.
    pub fn key_stats(&self) -> Vec<(CacheKey, KeyStats)> {
        let Some(per_key) = &self.per_key else {
            return Vec::new();
        };
        let mut stats: Vec<_> = per_key
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!(target = SOURCE, op, "recovered poisoned cache lock");
            poisoned.into_inner()
        })
    }

    fn count(&self, key: &CacheKey, outcome: Outcome) {
        let (total, metric) = match outcome {
            Outcome::Hit => (&self.hits, METRIC_CACHE_HIT),
            Outcome::Miss => (&self.misses, METRIC_CACHE_MISS),
            Outcome::Expired => (&self.expirations, METRIC_CACHE_EXPIRE),
            Outcome::Evicted => (&self.evictions, METRIC_CACHE_EVICT),
        };
        total.fetch_add(1, Ordering::Relaxed);
        counter!(metric).increment(1);

        if let Some(per_key) = &self.per_key {
            let mut stats = per_key.entry(key.clone()).or_default();
            match outcome {
                Outcome::Hit => stats.hits += 1,
                Outcome::Miss => stats.misses += 1,
                Outcome::Expired => stats.expirations += 1,
                Outcome::Evicted => stats.evictions += 1,
            }
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}
