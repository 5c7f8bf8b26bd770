//! Connection bookkeeping that survives reconnects.

use bucketcast_wire::Frame;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::transport::OpenRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

/// What to do with a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Deliver,
    /// Replay of something already delivered on this segment.
    Duplicate,
}

/// Outcome of a failed or dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after roughly this many milliseconds.
    After { delay_ms: u64, attempt: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectState {
    ready_state: ReadyState,
    last_event_id: Option<String>,
    attempt_count: u32,
    next_delay_ms: u64,
    session_id: Uuid,
    previous_connection_trace_id: Option<String>,
    current_trace_id: Option<String>,
    connection_sequence: u32,
    awaiting_first_frame: bool,
    backoff: Backoff,
    max_attempts: u32,
}

impl ReconnectState {
    pub fn new(session_id: Uuid, backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            ready_state: ReadyState::Connecting,
            last_event_id: None,
            attempt_count: 0,
            next_delay_ms: backoff.floor_ms(),
            session_id,
            previous_connection_trace_id: None,
            current_trace_id: None,
            connection_sequence: 1,
            awaiting_first_frame: false,
            backoff,
            max_attempts,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_delay_ms(&self) -> u64 {
        self.next_delay_ms
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn previous_connection_trace_id(&self) -> Option<&str> {
        self.previous_connection_trace_id.as_deref()
    }

    pub fn connection_sequence(&self) -> u32 {
        self.connection_sequence
    }

    /// Request for the next physical connection.
    pub fn open_request(&self) -> OpenRequest {
        OpenRequest {
            session_id: self.session_id,
            connection_sequence: self.connection_sequence,
            last_event_id: self.last_event_id.clone(),
            previous_trace_id: self.previous_connection_trace_id.clone(),
        }
    }

    /// The server accepted the connection; the correlation handoff is complete.
    pub fn on_open(&mut self, trace_id: Option<String>) {
        self.ready_state = ReadyState::Open;
        self.attempt_count = 0;
        self.next_delay_ms = self.backoff.floor_ms();
        self.previous_connection_trace_id = None;
        self.current_trace_id = trace_id;
        self.awaiting_first_frame = true;
    }

    /// Track `frame` and decide whether the application should see it.
    ///
    /// The first frame of a connection always starts a segment, so a server
    /// that restarted its numbering is accepted rather than dropped.
    pub fn on_frame(&mut self, frame: &Frame) -> FrameDisposition {
        if let Some(retry) = frame.retry {
            self.next_delay_ms = self.backoff.clamp(retry);
        }

        if !self.awaiting_first_frame {
            let last = self.last_event_id.as_deref().and_then(|id| id.parse::<u64>().ok());
            if matches!((last, frame.numeric_id()), (Some(last), Some(id)) if id <= last) {
                return FrameDisposition::Duplicate;
            }
        }

        self.awaiting_first_frame = false;
        self.last_event_id = Some(frame.id.clone());
        FrameDisposition::Deliver
    }

    /// Record a failed open or a dropped stream.
    ///
    /// `failed_trace_id` is the trace token of the failed connection when the
    /// transport reported one; otherwise the token of the last open
    /// connection is carried forward.
    ///
    /// The returned delay is the current `next_delay_ms`; doubling applies to
    /// the attempt after it, so the first retry waits the initial backoff.
    pub fn on_failure(&mut self, failed_trace_id: Option<String>) -> RetryDecision {
        self.ready_state = ReadyState::Connecting;
        self.awaiting_first_frame = false;
        self.attempt_count = self.attempt_count.saturating_add(1);

        if let Some(trace) = failed_trace_id.or_else(|| self.current_trace_id.take()) {
            self.previous_connection_trace_id = Some(trace);
        }
        self.current_trace_id = None;

        if self.attempt_count > self.max_attempts {
            self.ready_state = ReadyState::Closed;
            return RetryDecision::Exhausted {
                attempts: self.attempt_count,
            };
        }

        self.connection_sequence = self.connection_sequence.saturating_add(1);
        let delay_ms = self.next_delay_ms;
        self.next_delay_ms = self.backoff.advance(self.next_delay_ms);
        RetryDecision::After {
            delay_ms,
            attempt: self.attempt_count,
        }
    }

    pub fn close(&mut self) {
        self.ready_state = ReadyState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn state(max_attempts: u32) -> ReconnectState {
        ReconnectState::new(Uuid::nil(), Backoff::new(1_000, 8_000, 0.2), max_attempts)
    }

    #[test]
    fn first_request_has_no_correlation_history() {
        let state = state(10);
        let request = state.open_request();
        assert_eq!(request.connection_sequence, 1);
        assert_eq!(request.last_event_id, None);
        assert_eq!(request.previous_trace_id, None);
        assert_eq!(state.ready_state(), ReadyState::Connecting);
    }

    #[test]
    fn failure_captures_trace_of_failed_connection() {
        let mut state = state(10);
        state.on_open(Some("trace-1".to_string()));
        state.on_frame(&Frame::new("1", "bucket_update", "{}"));

        let decision = state.on_failure(None);
        assert_eq!(
            decision,
            RetryDecision::After {
                delay_ms: 1_000,
                attempt: 1
            }
        );

        let request = state.open_request();
        assert_eq!(request.connection_sequence, 2);
        assert_eq!(request.previous_trace_id.as_deref(), Some("trace-1"));
        assert_eq!(request.last_event_id.as_deref(), Some("1"));

        state.on_open(Some("trace-2".to_string()));
        assert_eq!(state.previous_connection_trace_id(), None);
    }

    #[test]
    fn failed_open_keeps_previous_trace() {
        let mut state = state(10);
        state.on_open(Some("trace-1".to_string()));
        state.on_failure(None);
        state.on_failure(None);
        assert_eq!(state.previous_connection_trace_id(), Some("trace-1"));
        assert_eq!(state.connection_sequence(), 3);
    }

    #[test]
    fn duplicates_are_dropped_within_a_connection() {
        let mut state = state(10);
        state.on_open(None);
        assert_eq!(state.on_frame(&Frame::new("4", "e", "")), FrameDisposition::Deliver);
        assert_eq!(state.on_frame(&Frame::new("4", "e", "")), FrameDisposition::Duplicate);
        assert_eq!(state.on_frame(&Frame::new("3", "e", "")), FrameDisposition::Duplicate);
        assert_eq!(state.on_frame(&Frame::new("5", "e", "")), FrameDisposition::Deliver);
        assert_eq!(state.last_event_id(), Some("5"));
    }

    #[test]
    fn restarted_numbering_starts_a_new_segment() {
        let mut state = state(10);
        state.on_open(None);
        state.on_frame(&Frame::new("9", "e", ""));
        state.on_failure(None);
        state.on_open(None);
        assert_eq!(state.on_frame(&Frame::new("1", "e", "")), FrameDisposition::Deliver);
        assert_eq!(state.on_frame(&Frame::new("1", "e", "")), FrameDisposition::Duplicate);
        assert_eq!(state.last_event_id(), Some("1"));
    }

    #[test]
    fn retry_hint_replaces_next_delay() {
        let mut state = state(10);
        state.on_open(None);
        state.on_frame(&Frame::new("1", "e", "").with_retry(2_500));
        assert_eq!(state.next_delay_ms(), 2_500);
        state.on_frame(&Frame::new("2", "e", "").with_retry(60_000));
        assert_eq!(state.next_delay_ms(), 8_000);
        assert_eq!(
            state.on_failure(None),
            RetryDecision::After {
                delay_ms: 8_000,
                attempt: 1
            }
        );
    }

    #[test]
    fn exhausts_after_ceiling() {
        let mut state = state(2);
        assert!(matches!(state.on_failure(None), RetryDecision::After { attempt: 1, .. }));
        assert!(matches!(state.on_failure(None), RetryDecision::After { attempt: 2, .. }));
        assert_eq!(state.on_failure(None), RetryDecision::Exhausted { attempts: 3 });
        assert_eq!(state.ready_state(), ReadyState::Closed);
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_resets_on_open(
            failures_before in 1usize..20,
            failures_after in 1usize..20,
        ) {
            let mut state = state(u32::MAX);
            let mut previous = state.next_delay_ms();
            for _ in 0..failures_before {
                state.on_failure(None);
                let next = state.next_delay_ms();
                prop_assert!(next >= previous);
                prop_assert!(next <= 8_000);
                previous = next;
            }

            state.on_open(None);
            prop_assert_eq!(state.next_delay_ms(), 1_000);
            prop_assert_eq!(state.attempt_count(), 0);

            let mut previous = state.next_delay_ms();
            for _ in 0..failures_after {
                state.on_failure(None);
                prop_assert!(state.next_delay_ms() >= previous);
                previous = state.next_delay_ms();
            }
        }
    }
}
