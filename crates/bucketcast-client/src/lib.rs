//! Reconnecting consumer for the bucketcast event stream.
//!
//! [`ReconnectingClient`] owns a [`Transport`], decodes frames incrementally
//! and reopens the stream with exponential backoff when it drops. Every
//! reconnect presents the last delivered frame id together with the
//! session id, connection sequence and the trace token of the connection it
//! replaces, so the server can stitch the physical connections together.

mod backoff;
mod client;
mod error;
mod state;
mod transport;

pub use backoff::{Backoff, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_BACKOFF_MS};
pub use client::{
    ClientConfig, ClientEvent, ClientHandle, CloseReason, DEFAULT_MAX_ATTEMPTS, ReconnectingClient,
};
pub use error::ClientError;
pub use state::{FrameDisposition, ReadyState, ReconnectState, RetryDecision};
pub use transport::{ByteStream, Connection, HttpTransport, OpenRequest, Transport, TransportError};
