//! Wire contract shared by the bucketcast server and its clients.
//!
//! - [`Frame`] and [`FrameDecoder`]: the text event-stream framing.
//! - [`Resolution`]: the enumerated bucket widths a client may request.
//! - [`TimeBucketSeries`], [`BucketUpdate`], [`Heartbeat`]: frame payloads.
//! - [`headers`] and [`events`]: names both sides must agree on.

mod decoder;
mod frame;
mod resolution;
mod series;

pub use decoder::{DEFAULT_MAX_FRAME_BYTES, FrameDecoder, FrameError};
pub use frame::Frame;
pub use resolution::{Resolution, UnknownResolution};
pub use series::{Bucket, BucketUpdate, Heartbeat, TimeBucketSeries};

/// HTTP header names used for resumption and cross-reconnect correlation.
pub mod headers {
    /// Last frame id the client received; resumption hint.
    pub const LAST_EVENT_ID: &str = "last-event-id";
    /// Stable identifier of the logical session, survives reconnects.
    pub const SESSION_ID: &str = "x-session-id";
    /// Trace token of the physical connection this request replaces.
    pub const PREVIOUS_TRACE_ID: &str = "x-previous-trace-id";
    /// Physical connection counter, starting at 1.
    pub const CONNECTION_SEQUENCE: &str = "x-connection-sequence";
    /// Response header carrying the server's trace token for the connection.
    pub const TRACE_ID: &str = "x-trace-id";
}

/// Event type tags carried in the `event` field.
pub mod events {
    pub const BUCKET_UPDATE: &str = "bucket_update";
    pub const HEARTBEAT: &str = "heartbeat";
    /// Event name assumed when a frame carries no `event` field.
    pub const DEFAULT: &str = "message";
}

/// Media type of the event stream.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
