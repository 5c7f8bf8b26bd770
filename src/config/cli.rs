use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the bucketcast binary.
#[derive(Debug, Parser)]
#[command(
    name = "bucketcast",
    version,
    about = "Resolution-aware cache and event stream for bucketed metrics"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "BUCKETCAST_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the streaming HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the cache capacity.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<u64>,

    /// Override the cold-start window.
    #[arg(long = "cache-cold-start-window-seconds", value_name = "SECONDS")]
    pub cache_cold_start_window_seconds: Option<u64>,

    /// Override the cache metrics reporting interval.
    #[arg(long = "cache-metrics-interval-seconds", value_name = "SECONDS")]
    pub cache_metrics_interval_seconds: Option<u64>,

    /// Toggle per-key cache metrics.
    #[arg(
        long = "cache-per-key-breakdown",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_per_key_breakdown: Option<bool>,

    /// Override the data tick interval.
    #[arg(long = "stream-tick-interval-seconds", value_name = "SECONDS")]
    pub stream_tick_interval_seconds: Option<u64>,

    /// Override the heartbeat interval.
    #[arg(long = "stream-heartbeat-interval-seconds", value_name = "SECONDS")]
    pub stream_heartbeat_interval_seconds: Option<u64>,

    /// Override the per-frame write timeout.
    #[arg(long = "stream-write-timeout-seconds", value_name = "SECONDS")]
    pub stream_write_timeout_seconds: Option<u64>,

    /// Override the upstream fetch timeout applied per tick.
    #[arg(long = "stream-fetch-timeout-seconds", value_name = "SECONDS")]
    pub stream_fetch_timeout_seconds: Option<u64>,

    /// Override the reconnect hint sent on the first frame.
    #[arg(long = "stream-retry-hint-ms", value_name = "MS")]
    pub stream_retry_hint_ms: Option<u64>,

    /// Override the number of frames buffered per connection.
    #[arg(long = "stream-channel-capacity", value_name = "COUNT")]
    pub stream_channel_capacity: Option<u64>,

    /// Override the concurrent session ceiling per client identity.
    #[arg(long = "admission-max-sessions-per-identity", value_name = "COUNT")]
    pub admission_max_sessions_per_identity: Option<u64>,

    /// Override the upstream data source base URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Override the upstream HTTP client timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,
}
