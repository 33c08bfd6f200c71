//! Redirects for in-fleet callers, reverse proxying for everyone else

use crate::common::tracing_middleware::{request_id, REQUEST_ID_HEADER};
use crate::common::{Error, Result};
use crate::router::{RequestRouter, FLEET_HOP_HEADER, FLEET_NODE_HEADER};
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode, Uri};
use axum::response::Response;
use tracing::debug;

/// Headers that describe one connection, not the message.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// `base` joined with the path and query of `uri`.
pub fn peer_url(base: &str, uri: &Uri) -> String {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// `307 Temporary Redirect` to the same path on `base`.
pub fn redirect(base: &str, uri: &Uri) -> Result<Response> {
    let location = peer_url(base, uri);
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Headers every call from this node to a peer carries.
pub fn fleet_headers(router: &RequestRouter, request_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(node) = HeaderValue::from_str(router.node_name()) {
        headers.insert(FLEET_NODE_HEADER, node);
    }
    headers.insert(FLEET_HOP_HEADER, HeaderValue::from_static("1"));
    if let Some(id) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(REQUEST_ID_HEADER, id);
    }
    headers
}

/// Replay `request` against `base` and relay the peer's answer.
pub async fn forward(router: &RequestRouter, base: &str, request: Request<Body>) -> Result<Response> {
    let id = request_id(&request);
    let (parts, body) = request.into_parts();
    let url = peer_url(base, &parts.uri);
    let body = axum::body::to_bytes(body, router.config().body_limit_bytes)
        .await
        .map_err(|e| Error::Upstream {
            peer: base.to_string(),
            reason: format!("request body: {}", e),
        })?;

    let mut headers = HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.extend(fleet_headers(router, id.as_deref()));

    debug!(%url, method = %parts.method, "forwarding request");
    let upstream = router
        .client()
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::Upstream {
            peer: base.to_string(),
            reason: e.to_string(),
        })?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = upstream.bytes().await.map_err(|e| Error::Upstream {
        peer: base.to_string(),
        reason: e.to_string(),
    })?;

    let mut response = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(Body::from(bytes))
        .map_err(|e| Error::Internal(e.to_string()))
}
