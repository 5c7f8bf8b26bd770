use metrics::gauge;
use tracing::{info, warn};

use crate::application::sink::{Sink, SinkRecord};

const METRIC_CACHE_HIT_RATE: &str = "bucketcast_cache_hit_rate";

/// Writes records as structured log events and mirrors aggregate cache
/// samples into gauges.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn emit(&self, record: SinkRecord) {
        match record {
            SinkRecord::CacheMetrics(metrics) => {
                if metrics.subject_id.is_none() {
                    gauge!(METRIC_CACHE_HIT_RATE).set(metrics.hit_rate);
                }
                info!(
                    target: "bucketcast::sink",
                    record = "cache_metrics",
                    hit_rate = metrics.hit_rate,
                    hits = metrics.hits,
                    misses = metrics.misses,
                    entry_count = metrics.entry_count,
                    evictions = metrics.evictions,
                    cold_start = metrics.cold_start,
                    subject_id = metrics.subject_id.as_deref(),
                    resolution = metrics.resolution.map(|r| r.as_str()),
                    "cache metrics"
                );
            }
            SinkRecord::SessionError(error) => {
                warn!(
                    target: "bucketcast::sink",
                    record = "session_error",
                    connection_id = %error.connection_id,
                    subject_id = %error.subject_id,
                    resolution = %error.resolution,
                    kind = error.kind.as_str(),
                    message = %error.message,
                    "session error"
                );
            }
        }
    }
}
