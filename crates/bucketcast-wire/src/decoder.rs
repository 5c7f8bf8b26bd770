//! Incremental event-stream decoder.
//!
//! Bytes are pushed as they arrive from the transport, in chunks of any
//! size. A frame is only produced once its terminating blank line has been
//! seen, so a field (or a multi-byte UTF-8 sequence) split across reads is
//! reassembled before parsing.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::{Frame, events};

/// Ceiling on the bytes a single pending frame may occupy.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame has no `id` field")]
    MissingId,
    #[error("`retry` value `{0}` is not a non-negative integer")]
    InvalidRetry(String),
    #[error("frame contains invalid UTF-8")]
    InvalidUtf8,
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("`{field}` must be a single line")]
    LineBreakInField { field: &'static str },
    #[error("`event` must not be empty")]
    EmptyEvent,
    #[error("`data` must not contain a carriage return")]
    CarriageReturnInData,
}

#[derive(Debug, Default)]
struct PendingFrame {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
    retry: Option<u64>,
    seen_field: bool,
    bytes: usize,
    error: Option<FrameError>,
}

impl PendingFrame {
    fn is_empty(&self) -> bool {
        !self.seen_field && self.error.is_none()
    }

    fn fail(&mut self, error: FrameError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn finish(self) -> Result<Frame, FrameError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let id = self.id.ok_or(FrameError::MissingId)?;
        let event = self
            .event
            .filter(|event| !event.is_empty())
            .unwrap_or_else(|| events::DEFAULT.to_string());
        Ok(Frame {
            id,
            event,
            data: self.data.unwrap_or_default(),
            retry: self.retry,
        })
    }

    fn apply_line(&mut self, line: &[u8]) {
        self.bytes += line.len();
        if self.error.is_some() {
            return;
        }

        let Ok(line) = std::str::from_utf8(line) else {
            self.fail(FrameError::InvalidUtf8);
            return;
        };

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        self.seen_field = true;
        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "retry" => match value.parse::<u64>() {
                Ok(retry) => self.retry = Some(retry),
                Err(_) => self.fail(FrameError::InvalidRetry(value.to_string())),
            },
            _ => {}
        }
    }
}

/// Receive-side half of the frame codec.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    pending: PendingFrame,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            pending: PendingFrame::default(),
            max_frame_bytes: max_frame_bytes.max(1),
        }
    }

    /// Append a chunk read from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` when more bytes are needed.
    ///
    /// A malformed frame yields one `Err` and is dropped up to its delimiter;
    /// subsequent frames decode normally.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') else {
                self.guard_partial_line();
                return None;
            };

            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                if self.pending.is_empty() {
                    continue;
                }
                let pending = std::mem::take(&mut self.pending);
                return Some(pending.finish());
            }

            self.pending.apply_line(&line);
            if self.pending.bytes > self.max_frame_bytes {
                self.pending.fail(FrameError::Oversized {
                    limit: self.max_frame_bytes,
                });
            }
        }
    }

    /// Push `chunk` and collect every frame it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Frame, FrameError>> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Drop buffered bytes and any partial frame, e.g. before a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending = PendingFrame::default();
    }

    /// Bytes buffered but not yet part of a complete line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // An unterminated line that already breaks the ceiling is discarded now;
    // the rest of it is consumed as part of the failed frame.
    fn guard_partial_line(&mut self) {
        if self.pending.bytes + self.buffer.len() > self.max_frame_bytes {
            self.pending.bytes += self.buffer.len();
            self.buffer.advance(self.buffer.len());
            self.pending.seen_field = true;
            self.pending.fail(FrameError::Oversized {
                limit: self.max_frame_bytes,
            });
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
