use std::sync::Arc;
use std::time::Duration;

use bucketcast_wire::{DEFAULT_MAX_FRAME_BYTES, Frame, FrameDecoder};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{
    Backoff, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_BACKOFF_MS,
};
use crate::state::{FrameDisposition, ReadyState, ReconnectState, RetryDecision};
use crate::transport::{ByteStream, Transport, TransportError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Reconnect tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Symmetric jitter applied to each reconnect delay, e.g. `0.2` for ±20%.
    pub jitter_fraction: f64,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_jitter_fraction(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.initial_backoff_ms,
            self.max_backoff_ms,
            self.jitter_fraction,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Torn down by the caller.
    Cancelled,
    /// Gave up after `attempts` consecutive failures.
    Exhausted { attempts: u32 },
}

/// Notifications delivered to the application callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open {
        sequence: u32,
        trace_id: Option<String>,
    },
    Frame(Frame),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Closed(CloseReason),
}

/// Consumes an event stream and keeps it alive across connection failures.
pub struct ReconnectingClient<T> {
    transport: Arc<T>,
    config: ClientConfig,
    session_id: Uuid,
}

impl<T: Transport> ReconnectingClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            session_id: Uuid::new_v4(),
        }
    }

    /// Reuse an existing logical session id.
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Start the driver task. `on_event` runs on that task.
    pub fn spawn<F>(self, on_event: F) -> ClientHandle
    where
        F: FnMut(ClientEvent) + Send + 'static,
    {
        let token = CancellationToken::new();
        let (state_tx, _) = watch::channel(ReadyState::Connecting);
        let state_tx = Arc::new(state_tx);
        let session_id = self.session_id;

        let task = tokio::spawn(self.run(token.clone(), Arc::clone(&state_tx), on_event));

        ClientHandle {
            token,
            state: state_tx,
            session_id,
            task,
        }
    }

    /// Drive connections until `token` is cancelled or attempts are exhausted.
    ///
    /// `on_event` is never invoked once `token` has been cancelled.
    pub async fn run<F>(
        self,
        token: CancellationToken,
        ready: Arc<watch::Sender<ReadyState>>,
        mut on_event: F,
    ) -> CloseReason
    where
        F: FnMut(ClientEvent) + Send + 'static,
    {
        let backoff = self.config.backoff();
        let mut state = ReconnectState::new(self.session_id, backoff, self.config.max_attempts);
        let mut emit = |event: ClientEvent| {
            if !token.is_cancelled() {
                on_event(event);
            }
        };

        let reason = loop {
            ready.send_replace(ReadyState::Connecting);
            let request = state.open_request();
            debug!(
                session_id = %request.session_id,
                connection_sequence = request.connection_sequence,
                last_event_id = ?request.last_event_id,
                previous_trace_id = ?request.previous_trace_id,
                "opening stream"
            );

            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => break CloseReason::Cancelled,
                opened = self.transport.open(&request) => opened,
            };

            let mut retry_after = None;
            match opened {
                Ok(connection) => {
                    state.on_open(connection.trace_id.clone());
                    ready.send_replace(ReadyState::Open);
                    info!(
                        session_id = %self.session_id,
                        connection_sequence = request.connection_sequence,
                        trace_id = ?connection.trace_id,
                        "stream open"
                    );
                    emit(ClientEvent::Open {
                        sequence: request.connection_sequence,
                        trace_id: connection.trace_id,
                    });

                    match self
                        .consume(connection.body, &mut state, &token, &mut emit)
                        .await
                    {
                        StreamEnd::Cancelled => break CloseReason::Cancelled,
                        StreamEnd::Failed(err) => {
                            warn!(session_id = %self.session_id, error = %err, "stream dropped");
                        }
                    }
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, error = %err, "failed to open stream");
                    retry_after = err.retry_after();
                }
            }

            match state.on_failure(None) {
                RetryDecision::Exhausted { attempts } => {
                    warn!(session_id = %self.session_id, attempts, "giving up on stream");
                    ready.send_replace(ReadyState::Closed);
                    emit(ClientEvent::Closed(CloseReason::Exhausted { attempts }));
                    return CloseReason::Exhausted { attempts };
                }
                RetryDecision::After { delay_ms, attempt } => {
                    let jittered = backoff.jittered(delay_ms, &mut rand::rng());
                    let delay = retry_after.map_or(jittered, |floor| jittered.max(floor));
                    emit(ClientEvent::Reconnecting { attempt, delay });
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break CloseReason::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        state.close();
        ready.send_replace(ReadyState::Closed);
        reason
    }

    async fn consume<E>(
        &self,
        mut body: ByteStream,
        state: &mut ReconnectState,
        token: &CancellationToken,
        emit: &mut E,
    ) -> StreamEnd
    where
        E: FnMut(ClientEvent),
    {
        let mut decoder = FrameDecoder::with_max_frame_bytes(self.config.max_frame_bytes);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamEnd::Cancelled,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    decoder.push(&bytes);
                    while let Some(decoded) = decoder.next_frame() {
                        match decoded {
                            Ok(frame) => match state.on_frame(&frame) {
                                FrameDisposition::Deliver => emit(ClientEvent::Frame(frame)),
                                FrameDisposition::Duplicate => {
                                    debug!(id = %frame.id, "dropping replayed frame");
                                }
                            },
                            Err(err) => {
                                warn!(session_id = %self.session_id, error = %err, "discarding malformed frame");
                            }
                        }
                    }
                }
                Some(Err(err)) => return StreamEnd::Failed(err),
                None => return StreamEnd::Failed(TransportError::Closed),
            }
        }
    }
}

enum StreamEnd {
    Cancelled,
    Failed(TransportError),
}

/// Owner's handle on a spawned client.
pub struct ClientHandle {
    token: CancellationToken,
    state: Arc<watch::Sender<ReadyState>>,
    session_id: Uuid,
    task: JoinHandle<CloseReason>,
}

impl ClientHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Token that tears the client down when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tear down the client. No callback starts after this returns; one
    /// already running on another worker finishes first.
    ///
    /// Aborting only schedules cancellation: the driver task, and the
    /// transport body it owns, are dropped the next time the runtime polls
    /// it. Await [`ClientHandle::wait`] to know the body has been released.
    pub fn close(&self) {
        self.token.cancel();
        self.task.abort();
        self.state.send_replace(ReadyState::Closed);
    }

    /// Wait for the driver to stop.
    pub async fn wait(self) -> CloseReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(_) => CloseReason::Cancelled,
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("session_id", &self.session_id)
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}
