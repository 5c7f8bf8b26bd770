use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use bucketcast::application::datasource::{DataSource, SourceError};
use bucketcast::application::registry::ConnectionRegistry;
use bucketcast::application::session::{StreamConfig, StreamContext};
use bucketcast::application::sink::RecordingSink;
use bucketcast::cache::{CacheConfig, CacheKey, CacheMetrics, CacheStore};
use bucketcast::domain::clock::ManualClock;
use bucketcast::infra::http::{HttpState, build_router};
use bucketcast_wire::{
    BucketUpdate, EVENT_STREAM_CONTENT_TYPE, Frame, FrameDecoder, TimeBucketSeries, events,
    headers as wire_headers,
};
use http_body_util::BodyExt;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const NOW: OffsetDateTime = datetime!(2024-03-01 10:00:30 UTC);

#[derive(Default)]
struct CountingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl DataSource for CountingSource {
    async fn fetch(
        &self,
        key: &CacheKey,
        _now: OffsetDateTime,
    ) -> Result<TimeBucketSeries, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TimeBucketSeries::new(
            key.subject_id.clone(),
            key.resolution,
            Vec::new(),
        ))
    }
}

struct TestApp {
    router: Router,
    registry: ConnectionRegistry,
    source: Arc<CountingSource>,
    shutdown: CancellationToken,
}

fn app(max_sessions_per_identity: u32) -> TestApp {
    let cache_config = CacheConfig::default();
    let clock = Arc::new(ManualClock::new(NOW));
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(CacheStore::new(&cache_config));
    let metrics = Arc::new(CacheMetrics::new(
        store.clone(),
        sink.clone(),
        clock.clone(),
        &cache_config,
    ));
    let source = Arc::new(CountingSource::default());
    let registry = ConnectionRegistry::new(max_sessions_per_identity);
    let shutdown = CancellationToken::new();

    let state = HttpState {
        stream: StreamContext {
            store,
            metrics,
            source: source.clone(),
            sink,
            clock,
            config: StreamConfig::default(),
        },
        registry: registry.clone(),
        shutdown: shutdown.clone(),
        retry_after_secs: 3,
    };

    TestApp {
        router: build_router(state),
        registry,
        source,
        shutdown,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

async fn next_frame(body: &mut Body, decoder: &mut FrameDecoder) -> Frame {
    loop {
        if let Some(frame) = decoder.next_frame() {
            return frame.expect("frame should decode");
        }
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("frame should arrive in time")
            .expect("body should stay open")
            .expect("body chunk should be readable");
        if let Ok(data) = chunk.into_data() {
            decoder.push(&data);
        }
    }
}

#[tokio::test]
async fn stream_opens_with_bucket_update_and_retry_hint() {
    let app = app(4);
    let response = app
        .router
        .clone()
        .oneshot(get("/stream/AAPL?resolution=1m"))
        .await
        .expect("router should respond");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
        Some(EVENT_STREAM_CONTENT_TYPE.as_bytes())
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).map(|v| v.as_bytes()),
        Some(b"no-cache".as_slice())
    );
    assert!(response.headers().contains_key(wire_headers::TRACE_ID));

    let mut body = response.into_body();
    let mut decoder = FrameDecoder::new();
    let frame = next_frame(&mut body, &mut decoder).await;

    assert_eq!(frame.id, "1");
    assert_eq!(frame.event, events::BUCKET_UPDATE);
    assert_eq!(frame.retry, Some(StreamConfig::default().retry_hint_ms));

    let update: BucketUpdate = serde_json::from_str(&frame.data).expect("update payload");
    assert_eq!(update.subject_id, "AAPL");
    assert_eq!(update.resolution.as_str(), "1m");
    assert_eq!(update.origin_timestamp, NOW);
    assert_eq!(app.source.calls.load(Ordering::SeqCst), 1);

    app.shutdown.cancel();
}

#[tokio::test]
async fn last_event_id_header_resumes_numbering() {
    let app = app(4);
    let request = Request::builder()
        .uri("/stream/AAPL?resolution=5m")
        .header(wire_headers::LAST_EVENT_ID, "41")
        .header(wire_headers::SESSION_ID, "dash-7")
        .header(wire_headers::CONNECTION_SEQUENCE, "2")
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut decoder = FrameDecoder::new();
    let frame = next_frame(&mut body, &mut decoder).await;
    assert_eq!(frame.numeric_id(), Some(42));

    app.shutdown.cancel();
}

#[tokio::test]
async fn unresumable_last_event_id_restarts_numbering() {
    let app = app(4);
    let request = Request::builder()
        .uri("/stream/AAPL?resolution=1m")
        .header(wire_headers::LAST_EVENT_ID, u64::MAX.to_string())
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut decoder = FrameDecoder::new();
    let frame = next_frame(&mut body, &mut decoder).await;
    assert_eq!(frame.numeric_id(), Some(1));

    app.shutdown.cancel();
}

#[tokio::test]
async fn last_event_id_query_resumes_numbering() {
    let app = app(4);
    let response = app
        .router
        .clone()
        .oneshot(get("/stream/AAPL?resolution=1h&last_event_id=7"))
        .await
        .expect("router should respond");

    let mut body = response.into_body();
    let mut decoder = FrameDecoder::new();
    let frame = next_frame(&mut body, &mut decoder).await;
    assert_eq!(frame.numeric_id(), Some(8));

    app.shutdown.cancel();
}

#[tokio::test]
async fn unknown_or_missing_resolution_is_rejected() {
    let app = app(4);
    for uri in ["/stream/AAPL?resolution=7m", "/stream/AAPL"] {
        let response = app
            .router
            .clone()
            .oneshot(get(uri))
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
    assert_eq!(app.registry.total_active(), 0);
    assert_eq!(app.source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn admission_limit_rejects_then_frees_slot_on_disconnect() {
    let app = app(1);

    let first = app
        .router
        .clone()
        .oneshot(get("/stream/AAPL?resolution=1m"))
        .await
        .expect("router should respond");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(app.registry.total_active(), 1);

    let rejected = app
        .router
        .clone()
        .oneshot(get("/stream/MSFT?resolution=1m"))
        .await
        .expect("router should respond");
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        rejected.headers().get(header::RETRY_AFTER).map(|v| v.as_bytes()),
        Some(b"3".as_slice())
    );

    drop(first);
    for _ in 0..100 {
        if app.registry.total_active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(app.registry.total_active(), 0);

    let admitted = app
        .router
        .clone()
        .oneshot(get("/stream/MSFT?resolution=1m"))
        .await
        .expect("router should respond");
    assert_eq!(admitted.status(), StatusCode::OK);

    app.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_ends_open_streams() {
    let app = app(4);
    let response = app
        .router
        .clone()
        .oneshot(get("/stream/AAPL?resolution=1m"))
        .await
        .expect("router should respond");
    let mut body = response.into_body();
    let mut decoder = FrameDecoder::new();
    next_frame(&mut body, &mut decoder).await;

    app.shutdown.cancel();

    let rest = tokio::time::timeout(Duration::from_secs(5), body.collect())
        .await
        .expect("stream should end after shutdown")
        .expect("body should end cleanly");
    assert!(rest.to_bytes().is_empty());

    for _ in 0..100 {
        if app.registry.total_active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(app.registry.total_active(), 0);
}

#[tokio::test]
async fn cache_stats_reports_the_stream_fill() {
    let app = app(4);
    let response = app
        .router
        .clone()
        .oneshot(get("/stream/AAPL?resolution=1m"))
        .await
        .expect("router should respond");
    let mut body = response.into_body();
    let mut decoder = FrameDecoder::new();
    next_frame(&mut body, &mut decoder).await;

    let stats = app
        .router
        .clone()
        .oneshot(get("/cache/stats"))
        .await
        .expect("router should respond");
    assert_eq!(stats.status(), StatusCode::OK);
    let bytes = stats
        .into_body()
        .collect()
        .await
        .expect("stats body")
        .to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).expect("stats json");

    assert_eq!(json["misses"], 1);
    assert_eq!(json["hits"], 0);
    assert_eq!(json["entry_count"], 1);
    assert_eq!(json["evictions"], 0);
    assert_eq!(json["expirations"], 0);
    assert_eq!(json["max_entries"], CacheConfig::default().max_entries);
    assert_eq!(json["cold_start"], true);

    app.shutdown.cancel();
}

#[tokio::test]
async fn health_is_no_content() {
    let app = app(4);
    let response = app
        .router
        .clone()
        .oneshot(get("/health"))
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
