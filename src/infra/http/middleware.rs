use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body, extract::ConnectInfo, http::Request, middleware::Next, response::Response,
};
use bucketcast_wire::headers;
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Admission identity: the peer IP when the listener recorded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity(pub String);

pub async fn set_peer_identity(mut request: Request<Body>, next: Next) -> Response {
    let identity = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_IDENTITY.to_string());
    request.extensions_mut().insert(PeerIdentity(identity));
    next.run(request).await
}

/// Log failed responses with the diagnostic report attached by the handler.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();
    let session_id = request
        .headers()
        .get(headers::SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "bucketcast::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                session_id = session_id,
                "request failed",
            );
        } else {
            warn!(
                target = "bucketcast::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                session_id = session_id,
                "client request error",
            );
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::{Router, extract::Extension, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn echo_identity() -> Router {
        Router::new()
            .route(
                "/",
                get(|Extension(PeerIdentity(identity)): Extension<PeerIdentity>| async move {
                    identity
                }),
            )
            .layer(axum::middleware::from_fn(set_peer_identity))
    }

    async fn identity_for(request: Request<Body>) -> String {
        let response = echo_identity()
            .oneshot(request)
            .await
            .expect("router should respond");
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn identity_is_peer_ip_or_anonymous() {
        let request = Request::builder().uri("/").body(Body::empty()).expect("request");
        assert_eq!(identity_for(request).await, ANONYMOUS_IDENTITY);

        let mut request = Request::builder().uri("/").body(Body::empty()).expect("request");
        let addr: SocketAddr = "10.1.2.3:50123".parse().expect("addr");
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(identity_for(request).await, "10.1.2.3");
    }
}
