//! HTTP surface: the event stream, cache statistics and a liveness check.

mod middleware;

use std::convert::Infallible;

use async_stream::stream;
use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, Path, Query, State},
    http::{
        HeaderMap, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bucketcast_wire::{EVENT_STREAM_CONTENT_TYPE, headers as wire_headers};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    application::{
        error::HttpError,
        registry::ConnectionRegistry,
        session::{Correlation, Session, SessionLoop, StreamContext},
    },
    cache::{CacheKey, MetricsRecord},
    domain::{error::DomainError, resolution},
};

pub use middleware::{
    PeerIdentity, RequestContext, log_responses, set_peer_identity, set_request_context,
};

const MAX_SUBJECT_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct HttpState {
    pub stream: StreamContext,
    pub registry: ConnectionRegistry,
    pub shutdown: CancellationToken,
    /// Seconds advertised in `retry-after` on admission rejection.
    pub retry_after_secs: u64,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/stream/{subject_id}", get(stream_events))
        .route("/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .with_state(state)
        .layer(axum_middleware::from_fn(set_peer_identity))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    resolution: Option<String>,
    /// Resumption hint for clients that cannot set headers.
    last_event_id: Option<String>,
}

async fn stream_events(
    State(state): State<HttpState>,
    Path(subject_id): Path<String>,
    Query(query): Query<StreamQuery>,
    Extension(PeerIdentity(identity)): Extension<PeerIdentity>,
    request_headers: HeaderMap,
) -> Result<Response, HttpError> {
    let key = stream_key(subject_id, query.resolution.as_deref())?;

    let connection_id = Uuid::new_v4();
    let guard = state
        .registry
        .admit(&identity, connection_id)
        .map_err(|err| HttpError::from(err).with_retry_after(state.retry_after_secs))?;

    let resume_after = header_str(&request_headers, wire_headers::LAST_EVENT_ID)
        .or(query.last_event_id.as_deref())
        .and_then(|raw| raw.trim().parse::<u64>().ok());
    let correlation = Correlation::new(
        header_str(&request_headers, wire_headers::SESSION_ID).map(str::to_string),
        header_str(&request_headers, wire_headers::PREVIOUS_TRACE_ID).map(str::to_string),
        header_str(&request_headers, wire_headers::CONNECTION_SEQUENCE)
            .and_then(|raw| raw.trim().parse::<u32>().ok()),
    );
    let trace_id = correlation.trace_id.clone();

    let session = Session::accept(connection_id, key, correlation, resume_after);
    let (mut frames, _task) =
        SessionLoop::spawn(state.stream.clone(), session, guard, state.shutdown.clone());

    let body = Body::from_stream(stream! {
        while let Some(bytes) = frames.recv().await {
            yield Ok::<Bytes, Infallible>(bytes);
        }
    });

    Ok((
        [
            (CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE.to_string()),
            (CACHE_CONTROL, "no-cache".to_string()),
        ],
        [(wire_headers::TRACE_ID, trace_id)],
        body,
    )
        .into_response())
}

fn stream_key(subject_id: String, raw_resolution: Option<&str>) -> Result<CacheKey, HttpError> {
    let subject_id = subject_id.trim().to_string();
    if subject_id.is_empty() || subject_id.len() > MAX_SUBJECT_ID_LEN {
        return Err(DomainError::validation(format!(
            "subject id must be 1..={MAX_SUBJECT_ID_LEN} bytes"
        ))
        .into());
    }
    if subject_id.chars().any(char::is_control) {
        return Err(DomainError::validation("subject id contains control characters").into());
    }

    let resolution = raw_resolution
        .ok_or_else(|| DomainError::validation("query parameter `resolution` is required"))
        .and_then(resolution::parse)?;
    Ok(CacheKey::new(subject_id, resolution))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Serialize)]
struct CacheStatsBody {
    #[serde(flatten)]
    aggregate: MetricsRecord,
    expirations: u64,
    max_entries: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    keys: Vec<MetricsRecord>,
}

async fn cache_stats(State(state): State<HttpState>) -> Json<CacheStatsBody> {
    let metrics = &state.stream.metrics;
    let store = metrics.store();
    Json(CacheStatsBody {
        aggregate: metrics.sample(),
        expirations: store.stats().expirations,
        max_entries: store.max_entries(),
        keys: metrics.breakdown(),
    })
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use bucketcast_wire::Resolution;

    use super::*;

    #[test]
    fn stream_key_requires_known_resolution() {
        let key = stream_key("AAPL".into(), Some("5m")).expect("valid");
        assert_eq!(key, CacheKey::new("AAPL", Resolution::FiveMinutes));

        assert_eq!(
            stream_key("AAPL".into(), Some("7m")).map_err(|e| e.status()).err(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            stream_key("AAPL".into(), None).map_err(|e| e.status()).err(),
            Some(StatusCode::BAD_REQUEST)
        );
    }

    #[test]
    fn stream_key_rejects_oversized_subject() {
        let long = "x".repeat(MAX_SUBJECT_ID_LEN + 1);
        assert!(stream_key(long, Some("1m")).is_err());
        assert!(stream_key("  ".into(), Some("1m")).is_err());
    }

    #[test]
    fn header_str_ignores_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert(wire_headers::SESSION_ID, "  ".parse().expect("header"));
        headers.insert(wire_headers::CONNECTION_SEQUENCE, " 3 ".parse().expect("header"));
        assert_eq!(header_str(&headers, wire_headers::SESSION_ID), None);
        assert_eq!(header_str(&headers, wire_headers::CONNECTION_SEQUENCE), Some("3"));
    }
}
