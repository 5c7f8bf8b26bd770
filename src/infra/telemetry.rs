use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global subscriber: `RUST_LOG` directives on top of the
/// configured level, span traces for errors, then JSON or compact output.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the service records. Runs once
/// per process; later calls are no-ops.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "bucketcast_cache_hit_total",
            Unit::Count,
            "Total number of cache lookups served from memory."
        );
        describe_counter!(
            "bucketcast_cache_miss_total",
            Unit::Count,
            "Total number of cache lookups that fell through to the data source."
        );
        describe_counter!(
            "bucketcast_cache_evict_total",
            Unit::Count,
            "Total number of cache evictions due to capacity."
        );
        describe_counter!(
            "bucketcast_cache_expire_total",
            Unit::Count,
            "Total number of entries dropped because their bucket width elapsed."
        );
        describe_gauge!(
            "bucketcast_cache_entries",
            Unit::Count,
            "Current number of cached series."
        );
        describe_gauge!(
            "bucketcast_cache_hit_rate",
            "Cache hit rate at the last metrics sample."
        );
        describe_gauge!(
            "bucketcast_sessions_active",
            Unit::Count,
            "Streaming sessions currently registered."
        );
        describe_counter!(
            "bucketcast_sessions_rejected_total",
            Unit::Count,
            "Total number of connections refused by admission control."
        );
        describe_counter!(
            "bucketcast_frames_sent_total",
            Unit::Count,
            "Total number of frames written to clients, by event."
        );
        describe_counter!(
            "bucketcast_ticks_skipped_total",
            Unit::Count,
            "Total number of data ticks skipped, by reason."
        );
        describe_histogram!(
            "bucketcast_upstream_fetch_ms",
            Unit::Milliseconds,
            "Data source fetch latency in milliseconds."
        );
    });
}
