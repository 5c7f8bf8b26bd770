//! Periodic cache reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use bucketcast_wire::Resolution;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::sink::{Sink, SinkRecord};
use crate::domain::clock::Clock;

use super::config::CacheConfig;
use super::store::{CacheStats, CacheStore, KeyStats};

/// One emitted sample. `subject_id`/`resolution` are set only on per-key
/// records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    pub evictions: u64,
    pub cold_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// `hits / (hits + misses)`, or 0 with no activity.
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Samples a [`CacheStore`] and forwards records to a [`Sink`].
pub struct CacheMetrics {
    store: Arc<CacheStore>,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    started_at: OffsetDateTime,
    cold_start_window: Duration,
    refreshed: AtomicBool,
    per_key_breakdown: bool,
}

impl CacheMetrics {
    pub fn new(
        store: Arc<CacheStore>,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
        config: &CacheConfig,
    ) -> Self {
        let started_at = clock.now();
        Self {
            store,
            sink,
            clock,
            started_at,
            cold_start_window: Duration::try_from(config.cold_start_window)
                .unwrap_or(Duration::MAX),
            refreshed: AtomicBool::new(false),
            per_key_breakdown: config.per_key_breakdown,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Mark that a fetch-and-populate cycle completed.
    pub fn record_refresh(&self) {
        if !self.refreshed.swap(true, Ordering::Relaxed) {
            debug!(target = "bucketcast::cache::metrics", "first cache refresh recorded");
        }
    }

    /// True until a refresh has completed and the cold-start window has
    /// elapsed since construction.
    pub fn cold_start(&self) -> bool {
        !self.refreshed.load(Ordering::Relaxed)
            || self.clock.now() - self.started_at < self.cold_start_window
    }

    pub fn sample(&self) -> MetricsRecord {
        let CacheStats {
            hits,
            misses,
            current_entries,
            evictions,
            ..
        } = self.store.stats();
        MetricsRecord {
            hit_rate: hit_rate(hits, misses),
            hits,
            misses,
            entry_count: current_entries,
            evictions,
            cold_start: self.cold_start(),
            subject_id: None,
            resolution: None,
        }
    }

    /// One record per key seen since startup; empty unless per-key
    /// breakdown is enabled.
    pub fn breakdown(&self) -> Vec<MetricsRecord> {
        if !self.per_key_breakdown {
            return Vec::new();
        }
        let cold_start = self.cold_start();
        self.store
            .key_stats()
            .into_iter()
            .map(|(key, stats)| {
                let KeyStats {
                    hits,
                    misses,
                    evictions,
                    ..
                } = stats;
                MetricsRecord {
                    hit_rate: hit_rate(hits, misses),
                    hits,
                    misses,
                    entry_count: usize::from(self.store.contains(&key)),
                    evictions,
                    cold_start,
                    subject_id: Some(key.subject_id),
                    resolution: Some(key.resolution),
                }
            })
            .collect()
    }

    /// Send the aggregate record (and any per-key records) to the sink.
    pub fn emit(&self) {
        let record = self.sample();
        debug!(
            target = "bucketcast::cache::metrics",
            hit_rate = record.hit_rate,
            entries = record.entry_count,
            cold_start = record.cold_start,
            "emitting cache metrics"
        );
        self.sink.emit(SinkRecord::CacheMetrics(record));
        for record in self.breakdown() {
            self.sink.emit(SinkRecord::CacheMetrics(record));
        }
    }

    /// Emit every `interval` until `token` is cancelled.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: StdDuration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => metrics.emit(),
                }
            }
            info!(target = "bucketcast::cache::metrics", "cache metrics reporter stopped");
        })
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("started_at", &self.started_at)
            .field("cold_start_window", &self.cold_start_window)
            .field("refreshed", &self.refreshed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bucketcast_wire::TimeBucketSeries;
    use time::macros::datetime;

    use super::*;
    use crate::application::sink::RecordingSink;
    use crate::cache::CacheKey;
    use crate::domain::clock::{ManualClock, TokioClock};

    const T0: OffsetDateTime = datetime!(2024-03-01 10:00:00 UTC);

    fn fixture(config: CacheConfig) -> (Arc<CacheMetrics>, Arc<RecordingSink>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(CacheStore::new(&config));
        let metrics = Arc::new(CacheMetrics::new(
            store,
            sink.clone(),
            clock.clone(),
            &config,
        ));
        (metrics, sink, clock)
    }

    fn populate(metrics: &CacheMetrics, subject: &str, now: OffsetDateTime) {
        let key = CacheKey::new(subject, Resolution::OneMinute);
        let series = TimeBucketSeries::new(subject, Resolution::OneMinute, Vec::new());
        metrics.store().set(key, Arc::new(series), now);
        metrics.record_refresh();
    }

    #[test]
    fn hit_rate_is_zero_without_activity() {
        assert_eq!(hit_rate(0, 0), 0.0);
        assert_eq!(hit_rate(3, 1), 0.75);
    }

    #[test]
    fn cold_start_reports_all_misses() {
        let (metrics, sink, clock) = fixture(CacheConfig::default());
        for n in 0..10 {
            let key = CacheKey::new(format!("S{n}"), Resolution::FiveMinutes);
            assert!(metrics.store().get(&key, clock.now()).is_none());
        }
        metrics.emit();

        let records = sink.metrics_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].hits, 0);
        assert_eq!(records[0].misses, 10);
        assert_eq!(records[0].hit_rate, 0.0);
        assert!(records[0].cold_start);
    }

    #[test]
    fn cold_start_clears_after_refresh_and_window() {
        let (metrics, _sink, clock) = fixture(CacheConfig::default());
        assert!(metrics.cold_start());

        clock.advance(Duration::seconds(45));
        assert!(metrics.cold_start(), "window elapsed but nothing refreshed");

        populate(&metrics, "AAPL", clock.now());
        assert!(!metrics.cold_start());
    }

    #[test]
    fn refresh_inside_window_stays_cold() {
        let (metrics, _sink, clock) = fixture(CacheConfig::default());
        populate(&metrics, "AAPL", clock.now());
        clock.advance(Duration::seconds(29));
        assert!(metrics.cold_start());
        clock.advance(Duration::seconds(1));
        assert!(!metrics.cold_start());
    }

    #[test]
    fn breakdown_emits_tagged_records() {
        let (metrics, sink, clock) = fixture(CacheConfig {
            per_key_breakdown: true,
            ..CacheConfig::default()
        });
        let key = CacheKey::new("AAPL", Resolution::OneMinute);
        metrics.store().get(&key, clock.now());
        populate(&metrics, "AAPL", clock.now());
        metrics.store().get(&key, clock.now());
        metrics.emit();

        let records = sink.metrics_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subject_id, None);
        let tagged = &records[1];
        assert_eq!(tagged.subject_id.as_deref(), Some("AAPL"));
        assert_eq!(tagged.resolution, Some(Resolution::OneMinute));
        assert_eq!(tagged.hit_rate, 0.5);
        assert_eq!(tagged.entry_count, 1);
    }

    #[test]
    fn record_omits_tags_when_aggregate() {
        let (metrics, _sink, _clock) = fixture(CacheConfig::default());
        let value = serde_json::to_value(metrics.sample()).expect("serialize");
        assert!(value.get("subject_id").is_none());
        assert_eq!(value["hit_rate"], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_emits_on_interval_until_cancelled() {
        let config = CacheConfig::default();
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(TokioClock::starting_at(T0));
        let metrics = Arc::new(CacheMetrics::new(
            Arc::new(CacheStore::new(&config)),
            sink.clone(),
            clock,
            &config,
        ));
        let token = CancellationToken::new();
        let handle = metrics.spawn_reporter(StdDuration::from_secs(60), token.clone());

        tokio::time::sleep(StdDuration::from_secs(150)).await;
        assert_eq!(sink.metrics_records().len(), 2);

        token.cancel();
        handle.await.expect("reporter joins");
        tokio::time::sleep(StdDuration::from_secs(120)).await;
        assert_eq!(sink.metrics_records().len(), 2);
    }
}
