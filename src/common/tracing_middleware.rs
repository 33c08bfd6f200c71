//! Structured logging and request tracing middleware
//!
//! Every request gets an `X-Request-ID` (propagated from the caller when
//! present) so a request can be followed across redirect and forward hops.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Header naming the fleet node that issued a request
pub const FLEET_NODE_HEADER: &str = "X-Fleet-Node";

/// Generate a new unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Request ID carried by `request`, if any
pub fn request_id<B>(request: &Request<B>) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Middleware that adds request ID and structured logging to each request
pub async fn request_tracing_middleware(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let start = Instant::now();

    let request_id = request_id(&request).unwrap_or_else(generate_request_id);
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header.clone() {
        // downstream handlers forward whatever they find here
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let fleet_peer = request
        .headers()
        .get(FLEET_NODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
        fleet_peer = %fleet_peer,
    );

    async move {
        info!("Request started");

        let mut response = next.run(request).await;

        let duration = start.elapsed();
        let status = response.status();

        if let Some(value) = header {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        if status.is_success() || status.is_redirection() || status.is_informational() {
            info!(
                status = %status.as_u16(),
                duration_ms = %duration.as_millis(),
                "Request completed"
            );
        } else if status.is_client_error() {
            warn!(
                status = %status.as_u16(),
                duration_ms = %duration.as_millis(),
                "Client error"
            );
        } else {
            warn!(
                status = %status.as_u16(),
                duration_ms = %duration.as_millis(),
                "Server error"
            );
        }

        response
    }
    .instrument(span)
    .await
}
