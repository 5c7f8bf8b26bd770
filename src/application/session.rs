//! Per-connection streaming loop.
//!
//! A session is accepted once admission has granted it a registry slot. It
//! then streams `bucket_update` frames on a fixed tick and on every bucket
//! rollover, plus `heartbeat` frames on their own cadence, until the client
//! goes away or the process shuts down. Closing always happens in one place
//! ([`SessionLoop::run`]), which releases the registry slot.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use bucketcast_wire::{BucketUpdate, Frame, Heartbeat, TimeBucketSeries, events};
use bytes::Bytes;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, CacheMetrics, CacheStore};
use crate::domain::clock::Clock;
use crate::domain::resolution;

use super::datasource::{DataSource, SourceError};
use super::registry::SessionGuard;
use super::sink::{SessionErrorKind, SessionErrorRecord, Sink, SinkRecord};

pub(crate) const METRIC_FRAMES_SENT: &str = "bucketcast_frames_sent_total";
pub(crate) const METRIC_TICKS_SKIPPED: &str = "bucketcast_ticks_skipped_total";
pub(crate) const METRIC_UPSTREAM_FETCH_MS: &str = "bucketcast_upstream_fetch_ms";

const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRY_HINT_MS: u64 = 1000;
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
    pub fetch_timeout: Duration,
    /// `retry` hint stamped on the first frame of every connection.
    pub retry_hint_ms: u64,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retry_hint_ms: DEFAULT_RETRY_HINT_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&crate::config::StreamSettings> for StreamConfig {
    fn from(settings: &crate::config::StreamSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval,
            heartbeat_interval: settings.heartbeat_interval,
            write_timeout: settings.write_timeout,
            fetch_timeout: settings.fetch_timeout,
            retry_hint_ms: settings.retry_hint_ms,
            channel_capacity: settings.channel_capacity.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Correlation metadata for one physical connection.
///
/// Client-supplied values are opaque strings; only the sequence is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub session_id: Option<String>,
    pub previous_trace_id: Option<String>,
    pub connection_sequence: u32,
    /// Server-issued token for this connection, echoed in `x-trace-id`.
    pub trace_id: String,
}

impl Correlation {
    pub fn new(
        session_id: Option<String>,
        previous_trace_id: Option<String>,
        connection_sequence: Option<u32>,
    ) -> Self {
        Self {
            session_id,
            previous_trace_id,
            connection_sequence: connection_sequence.unwrap_or(1).max(1),
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: Uuid,
    pub key: CacheKey,
    pub state: SessionState,
    /// Last frame id written successfully. 0 before any frame.
    pub last_event_id: u64,
    pub sequence: u32,
    pub correlation: Correlation,
}

impl Session {
    /// A new connection. A resumption hint continues numbering after it; a
    /// hint that cannot be continued starts a new segment at 1.
    pub fn accept(
        connection_id: Uuid,
        key: CacheKey,
        correlation: Correlation,
        resume_after: Option<u64>,
    ) -> Self {
        Self {
            connection_id,
            key,
            state: SessionState::Connecting,
            last_event_id: resume_after
                .filter(|id| id.checked_add(1).is_some())
                .unwrap_or(0),
            sequence: correlation.connection_sequence,
            correlation,
        }
    }

    /// Wraps to 1 rather than overflowing; 0 is never issued.
    pub fn next_event_id(&self) -> u64 {
        self.last_event_id.checked_add(1).unwrap_or(1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("client disconnected")]
    Disconnected,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Writes encoded frames into the channel that backs the response body.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    timeout: Duration,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Bytes>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    pub async fn write(&self, encoded: Bytes) -> Result<(), WriteError> {
        match tokio::time::timeout(self.timeout, self.tx.send(encoded)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(WriteError::Disconnected),
            Err(_) => Err(WriteError::Timeout(self.timeout)),
        }
    }

    /// Resolves once the reading side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Shared collaborators every session loop works against.
#[derive(Clone)]
pub struct StreamContext {
    pub store: Arc<CacheStore>,
    pub metrics: Arc<CacheMetrics>,
    pub source: Arc<dyn DataSource>,
    pub sink: Arc<dyn Sink>,
    pub clock: Arc<dyn Clock>,
    pub config: StreamConfig,
}

/// Why a session loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Disconnected,
    WriteTimeout,
}

impl SessionEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionEnd::Shutdown => "shutdown",
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::WriteTimeout => "write_timeout",
        }
    }
}

impl From<WriteError> for SessionEnd {
    fn from(error: WriteError) -> Self {
        match error {
            WriteError::Disconnected => SessionEnd::Disconnected,
            WriteError::Timeout(_) => SessionEnd::WriteTimeout,
        }
    }
}

pub struct SessionLoop {
    ctx: StreamContext,
    session: Session,
    writer: ChannelWriter,
    shutdown: CancellationToken,
    guard: Option<SessionGuard>,
    frames_sent: u64,
}

impl SessionLoop {
    pub fn new(
        ctx: StreamContext,
        session: Session,
        writer: ChannelWriter,
        guard: SessionGuard,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            session,
            writer,
            shutdown,
            guard: Some(guard),
            frames_sent: 0,
        }
    }

    /// Spawn a loop for `session` and return the receiving end of its
    /// frame channel.
    pub fn spawn(
        ctx: StreamContext,
        session: Session,
        guard: SessionGuard,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<Bytes>, JoinHandle<SessionEnd>) {
        let (tx, rx) = mpsc::channel(ctx.config.channel_capacity.max(1));
        let writer = ChannelWriter::new(tx, ctx.config.write_timeout);
        let session_loop = SessionLoop::new(ctx, session, writer, guard, shutdown);
        (rx, tokio::spawn(session_loop.run()))
    }

    pub async fn run(mut self) -> SessionEnd {
        let correlation = &self.session.correlation;
        let span = info_span!(
            "session",
            connection_id = %self.session.connection_id,
            subject_id = %self.session.key.subject_id,
            resolution = %self.session.key.resolution,
            session_id = correlation.session_id.as_deref().unwrap_or(""),
            connection_sequence = correlation.connection_sequence,
            previous_trace_id = correlation.previous_trace_id.as_deref().unwrap_or(""),
            trace_id = %correlation.trace_id,
        );

        async move {
            self.session.state = SessionState::Open;
            info!(
                target = "bucketcast::session",
                resume_after = self.session.last_event_id,
                "session accepted"
            );

            let end = self.stream().await;
            self.close(end);
            end
        }
        .instrument(span)
        .await
    }

    async fn stream(&mut self) -> SessionEnd {
        if let Err(error) = self.tick().await {
            return error.into();
        }

        let config = &self.ctx.config;
        let start = Instant::now();
        let mut ticker = tokio::time::interval_at(start + config.tick_interval, config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat =
            tokio::time::interval_at(start + config.heartbeat_interval, config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let rollover = tokio::time::sleep(self.until_rollover());
        tokio::pin!(rollover);

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = self.writer.closed() => return SessionEnd::Disconnected,
                _ = &mut rollover => {
                    debug!(target = "bucketcast::session", "bucket rolled over");
                    let result = self.tick().await;
                    rollover.as_mut().reset(Instant::now() + self.until_rollover());
                    ticker.reset();
                    result
                }
                _ = ticker.tick() => self.tick().await,
                _ = heartbeat.tick() => self.heartbeat().await,
            };
            if let Err(error) = result {
                return error.into();
            }
        }
    }

    fn close(&mut self, end: SessionEnd) {
        self.session.state = SessionState::Closed;
        // Dropping the guard deregisters the connection.
        self.guard.take();

        if matches!(end, SessionEnd::Disconnected | SessionEnd::WriteTimeout) {
            self.ctx.sink.emit(SinkRecord::SessionError(self.error_record(
                SessionErrorKind::WriteFailed,
                end.as_str().to_string(),
            )));
        }
        info!(
            target = "bucketcast::session",
            reason = end.as_str(),
            last_event_id = self.session.last_event_id,
            frames_sent = self.frames_sent,
            "session closed"
        );
    }

    /// Time until the next bucket boundary of this session's resolution.
    fn until_rollover(&self) -> Duration {
        let now = self.ctx.clock.now();
        let next = resolution::next_boundary(now, self.session.key.resolution);
        Duration::try_from(next - now).unwrap_or(Duration::ZERO)
    }

    /// Serve one data tick. Upstream failures skip the tick; only a write
    /// failure is returned.
    async fn tick(&mut self) -> Result<(), WriteError> {
        let now = self.ctx.clock.now();
        let data = match self.ctx.store.get(&self.session.key, now) {
            Some(data) => data,
            None => match self.fetch(now).await {
                Ok(series) => {
                    let data = Arc::new(series);
                    self.ctx
                        .store
                        .set(self.session.key.clone(), Arc::clone(&data), now);
                    self.ctx.metrics.record_refresh();
                    data
                }
                Err(error) => {
                    self.skip_tick(SessionErrorKind::UpstreamUnavailable, &error);
                    return Ok(());
                }
            },
        };

        let update = BucketUpdate {
            subject_id: self.session.key.subject_id.clone(),
            resolution: self.session.key.resolution,
            origin_timestamp: self.ctx.clock.now(),
            series: TimeBucketSeries::clone(&data),
        };
        let frame = match Frame::json(
            self.session.next_event_id().to_string(),
            events::BUCKET_UPDATE,
            &update,
        ) {
            Ok(frame) => frame,
            Err(error) => {
                self.skip_tick(SessionErrorKind::Encode, &error);
                return Ok(());
            }
        };
        self.send(frame).await
    }

    async fn heartbeat(&mut self) -> Result<(), WriteError> {
        let payload = Heartbeat {
            timestamp: self.ctx.clock.now(),
        };
        match Frame::json(
            self.session.next_event_id().to_string(),
            events::HEARTBEAT,
            &payload,
        ) {
            Ok(frame) => self.send(frame).await,
            Err(error) => {
                warn!(target = "bucketcast::session", error = %error, "heartbeat encode failed");
                Ok(())
            }
        }
    }

    async fn fetch(&self, now: OffsetDateTime) -> Result<TimeBucketSeries, SourceError> {
        let timeout = self.ctx.config.fetch_timeout;
        let started = StdInstant::now();
        let result = tokio::time::timeout(timeout, self.ctx.source.fetch(&self.session.key, now))
            .await
            .unwrap_or(Err(SourceError::Timeout(timeout)));
        histogram!(METRIC_UPSTREAM_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Write `frame`, stamping the retry hint on the connection's first
    /// frame. The id is recorded only once the write succeeded.
    async fn send(&mut self, frame: Frame) -> Result<(), WriteError> {
        let frame = if self.frames_sent == 0 {
            frame.with_retry(self.ctx.config.retry_hint_ms)
        } else {
            frame
        };
        let encoded = match frame.encode_bytes() {
            Ok(encoded) => encoded,
            Err(error) => {
                self.skip_tick(SessionErrorKind::Encode, &error);
                return Ok(());
            }
        };

        if let Err(error) = self.writer.write(encoded).await {
            warn!(
                target = "bucketcast::session",
                error = %error,
                event_id = %frame.id,
                "frame write failed"
            );
            return Err(error);
        }

        self.session.last_event_id = self.session.next_event_id();
        self.frames_sent += 1;
        counter!(METRIC_FRAMES_SENT, "event" => frame.event).increment(1);
        Ok(())
    }

    fn skip_tick(&self, kind: SessionErrorKind, error: &dyn std::error::Error) {
        counter!(METRIC_TICKS_SKIPPED, "reason" => kind.as_str()).increment(1);
        warn!(
            target = "bucketcast::session",
            kind = kind.as_str(),
            error = %error,
            "tick skipped"
        );
        self.ctx
            .sink
            .emit(SinkRecord::SessionError(self.error_record(kind, error.to_string())));
    }

    fn error_record(&self, kind: SessionErrorKind, message: String) -> SessionErrorRecord {
        SessionErrorRecord {
            connection_id: self.session.connection_id.to_string(),
            subject_id: self.session.key.subject_id.clone(),
            resolution: self.session.key.resolution.to_string(),
            kind,
            message,
        }
    }
}
