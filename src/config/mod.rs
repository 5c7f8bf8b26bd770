//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "bucketcast";
const ENV_PREFIX: &str = "BUCKETCAST";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 256;
const DEFAULT_COLD_START_WINDOW_SECS: u64 = 30;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRY_HINT_MS: u64 = 1000;
const DEFAULT_CHANNEL_CAPACITY: u64 = 16;
const DEFAULT_MAX_SESSIONS_PER_IDENTITY: u64 = 8;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub stream: StreamSettings,
    pub admission: AdmissionSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: NonZeroUsize,
    pub cold_start_window: Duration,
    pub metrics_interval: Duration,
    pub per_key_breakdown: bool,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry_hint_ms: u64,
    pub channel_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub max_sessions_per_identity: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base URL of the series provider. Required to serve.
    pub url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    stream: RawStreamSettings,
    admission: RawAdmissionSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(seconds) = overrides.cache_cold_start_window_seconds {
            self.cache.cold_start_window_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_metrics_interval_seconds {
            self.cache.metrics_interval_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.cache_per_key_breakdown {
            self.cache.per_key_breakdown = Some(enabled);
        }
        if let Some(seconds) = overrides.stream_tick_interval_seconds {
            self.stream.tick_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.stream_heartbeat_interval_seconds {
            self.stream.heartbeat_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.stream_write_timeout_seconds {
            self.stream.write_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.stream_fetch_timeout_seconds {
            self.stream.fetch_timeout_seconds = Some(seconds);
        }
        if let Some(ms) = overrides.stream_retry_hint_ms {
            self.stream.retry_hint_ms = Some(ms);
        }
        if let Some(capacity) = overrides.stream_channel_capacity {
            self.stream.channel_capacity = Some(capacity);
        }
        if let Some(max) = overrides.admission_max_sessions_per_identity {
            self.admission.max_sessions_per_identity = Some(max);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }
        if let Some(seconds) = overrides.upstream_timeout_seconds {
            self.upstream.timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            stream,
            admission,
            upstream,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            stream: build_stream_settings(stream)?,
            admission: build_admission_settings(admission)?,
            upstream: build_upstream_settings(upstream)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = seconds(
        server.graceful_shutdown_seconds,
        DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    Ok(CacheSettings {
        max_entries: non_zero_usize(
            cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            "cache.max_entries",
        )?,
        cold_start_window: seconds(
            cache.cold_start_window_seconds,
            DEFAULT_COLD_START_WINDOW_SECS,
            "cache.cold_start_window_seconds",
        )?,
        metrics_interval: seconds(
            cache.metrics_interval_seconds,
            DEFAULT_METRICS_INTERVAL_SECS,
            "cache.metrics_interval_seconds",
        )?,
        per_key_breakdown: cache.per_key_breakdown.unwrap_or(false),
    })
}

fn build_stream_settings(stream: RawStreamSettings) -> Result<StreamSettings, LoadError> {
    let retry_hint_ms = stream.retry_hint_ms.unwrap_or(DEFAULT_RETRY_HINT_MS);
    if retry_hint_ms == 0 {
        return Err(LoadError::invalid(
            "stream.retry_hint_ms",
            "must be greater than zero",
        ));
    }

    Ok(StreamSettings {
        tick_interval: seconds(
            stream.tick_interval_seconds,
            DEFAULT_TICK_INTERVAL_SECS,
            "stream.tick_interval_seconds",
        )?,
        heartbeat_interval: seconds(
            stream.heartbeat_interval_seconds,
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
            "stream.heartbeat_interval_seconds",
        )?,
        write_timeout: seconds(
            stream.write_timeout_seconds,
            DEFAULT_WRITE_TIMEOUT_SECS,
            "stream.write_timeout_seconds",
        )?,
        fetch_timeout: seconds(
            stream.fetch_timeout_seconds,
            DEFAULT_FETCH_TIMEOUT_SECS,
            "stream.fetch_timeout_seconds",
        )?,
        retry_hint_ms,
        channel_capacity: non_zero_usize(
            stream.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            "stream.channel_capacity",
        )?,
    })
}

fn build_admission_settings(
    admission: RawAdmissionSettings,
) -> Result<AdmissionSettings, LoadError> {
    let max_sessions_per_identity = non_zero_u32(
        admission
            .max_sessions_per_identity
            .unwrap_or(DEFAULT_MAX_SESSIONS_PER_IDENTITY),
        "admission.max_sessions_per_identity",
    )?;
    Ok(AdmissionSettings {
        max_sessions_per_identity,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let url = match upstream.url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let url = Url::parse(raw)
                .map_err(|err| LoadError::invalid("upstream.url", format!("{raw}: {err}")))?;
            if url.cannot_be_a_base() {
                return Err(LoadError::invalid(
                    "upstream.url",
                    "must be an absolute http(s) URL",
                ));
            }
            Some(url)
        }
    };

    let timeout = seconds(
        upstream.timeout_seconds,
        DEFAULT_UPSTREAM_TIMEOUT_SECS,
        "upstream.timeout_seconds",
    )?;

    Ok(UpstreamSettings { url, timeout })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_entries: Option<u64>,
    cold_start_window_seconds: Option<u64>,
    metrics_interval_seconds: Option<u64>,
    per_key_breakdown: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStreamSettings {
    tick_interval_seconds: Option<u64>,
    heartbeat_interval_seconds: Option<u64>,
    write_timeout_seconds: Option<u64>,
    fetch_timeout_seconds: Option<u64>,
    retry_hint_ms: Option<u64>,
    channel_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAdmissionSettings {
    max_sessions_per_identity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn seconds(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
