use std::time::Duration;

use async_trait::async_trait;
use bucketcast_wire::{EVENT_STREAM_CONTENT_TYPE, headers};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url, header};
use thiserror::Error;
use uuid::Uuid;

/// Everything the client attaches when opening a physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub session_id: Uuid,
    /// Starts at 1 and increments on every reconnect.
    pub connection_sequence: u32,
    pub last_event_id: Option<String>,
    pub previous_trace_id: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An open event stream.
pub struct Connection {
    /// Server-assigned trace token for this physical connection.
    pub trace_id: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server rejected the connection (too many sessions)")]
    Rejected { retry_after: Option<Duration> },
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("stream closed by server")]
    Closed,
}

impl TransportError {
    /// Server-requested minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Rejected { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Seam between the reconnect state machine and the network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, request: &OpenRequest) -> Result<Connection, TransportError>;
}

/// `reqwest` transport streaming the response body.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url) -> Result<Self, TransportError> {
        let client = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self { client, url })
    }

    pub fn user_agent() -> &'static str {
        concat!("bucketcast-client/", env!("CARGO_PKG_VERSION"))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &OpenRequest) -> Result<Connection, TransportError> {
        let mut req = self
            .client
            .get(self.url.clone())
            .header(header::ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(headers::SESSION_ID, request.session_id.to_string())
            .header(
                headers::CONNECTION_SEQUENCE,
                request.connection_sequence.to_string(),
            );
        if let Some(last_event_id) = &request.last_event_id {
            req = req.header(headers::LAST_EVENT_ID, last_event_id);
        }
        if let Some(previous) = &request.previous_trace_id {
            req = req.header(headers::PREVIOUS_TRACE_ID, previous);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(TransportError::Rejected { retry_after });
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let trace_id = resp
            .headers()
            .get(headers::TRACE_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes_stream()
            .map_err(|err| TransportError::Read(err.to_string()))
            .boxed();

        Ok(Connection { trace_id, body })
    }
}
