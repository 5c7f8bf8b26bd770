use std::fmt::Write as _;

use bytes::Bytes;
use serde::Serialize;

use crate::{FrameError, events};

/// One unit of the event stream.
///
/// `id` and `event` are single-line values and `event` is never empty.
/// `data` may span several `\n`-separated lines; each line is written as its
/// own `data:` field and rejoined on decode. Frames outside these rules have
/// no faithful wire form and [`Frame::encode`] refuses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: String,
    pub event: String,
    pub data: String,
    /// Reconnect-delay hint in milliseconds.
    pub retry: Option<u64>,
}

impl Frame {
    pub fn new(id: impl Into<String>, event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event: event.into(),
            data: data.into(),
            retry: None,
        }
    }

    /// Build a frame whose `data` is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(
        id: impl Into<String>,
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, event, serde_json::to_string(payload)?))
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event == events::HEARTBEAT
    }

    /// Numeric value of `id`, when it has one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.parse().ok()
    }

    /// Whether this frame survives an encode and decode unchanged.
    pub fn check(&self) -> Result<(), FrameError> {
        if has_line_break(&self.id) {
            return Err(FrameError::LineBreakInField { field: "id" });
        }
        if has_line_break(&self.event) {
            return Err(FrameError::LineBreakInField { field: "event" });
        }
        if self.event.is_empty() {
            return Err(FrameError::EmptyEvent);
        }
        // Decoders treat `\r` as a line terminator and rejoin with `\n`.
        if self.data.contains('\r') {
            return Err(FrameError::CarriageReturnInData);
        }
        Ok(())
    }

    /// Encode as `id: ..\nevent: ..\ndata: ..\n[retry: ..\n]\n`.
    pub fn encode(&self) -> Result<String, FrameError> {
        self.check()?;
        let mut out = String::with_capacity(self.data.len() + self.id.len() + self.event.len() + 32);
        // Writing into a String cannot fail.
        let _ = writeln!(out, "id: {}", self.id);
        let _ = writeln!(out, "event: {}", self.event);
        for line in self.data.split('\n') {
            let _ = writeln!(out, "data: {line}");
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(out, "retry: {retry}");
        }
        out.push('\n');
        Ok(out)
    }

    pub fn encode_bytes(&self) -> Result<Bytes, FrameError> {
        self.encode().map(Bytes::from)
    }
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\r', '\n'])
}
