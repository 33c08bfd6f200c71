//! Routing endpoints
//!
//! - `GET /sensor?sensorid=`: one key, served, redirected or forwarded
//! - `GET /sensors?sensorids=a,b`: many keys, merged per owner
//! - `GET /ws`: websocket sessions (`?sensorid=` for single-key sessions)

use crate::common::tracing_middleware::REQUEST_ID_HEADER;
use crate::common::{parse_key_list, validate_key, Error, Result, RouteKind};
use crate::router::{
    aggregate, proxy, ws, RequestRouter, RouteDecision, Target, FLEET_HOP_HEADER,
    FLEET_NODE_HEADER,
};
use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, Request, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct SensorQuery {
    sensorid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SensorsQuery {
    sensorids: Option<String>,
}

pub fn create_router(router: Arc<RequestRouter>) -> Router {
    Router::new()
        .route("/sensor", get(get_sensor))
        .route("/sensors", get(get_sensors))
        .route("/ws", get(ws_entry))
        .with_state(router)
}

/// Calls from another fleet node carry its name.
fn is_in_fleet(headers: &HeaderMap) -> bool {
    headers.contains_key(FLEET_NODE_HEADER)
}

/// Calls already routed once by a peer.
fn is_hop(headers: &HeaderMap) -> bool {
    headers.contains_key(FLEET_HOP_HEADER)
}

fn header_request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok())
}

fn status_label(e: &Error) -> &'static str {
    match e {
        Error::UnknownIdentifier(_) => "unknown_identifier",
        Error::Unavailable(_) => "unavailable",
        Error::InvalidConfig(_) => "invalid_request",
        Error::Upstream { .. } | Error::Http(_) | Error::WebSocket(_) => "upstream_error",
        Error::Timeout(_) => "timeout",
        _ => "error",
    }
}

pub fn error_response(e: &Error) -> Response {
    (
        e.to_http_status(),
        Json(json!({ "status": status_label(e), "error": e.to_string() })),
    )
        .into_response()
}

fn unknown_identifier(key: &str) -> Response {
    let e = Error::UnknownIdentifier(key.to_string());
    (
        e.to_http_status(),
        Json(json!({ "status": status_label(&e), "sensorid": key, "error": e.to_string() })),
    )
        .into_response()
}

fn single_key(raw: Option<String>) -> Result<String> {
    let key = raw.unwrap_or_default().trim().to_string();
    validate_key(&key)?;
    Ok(key)
}

/// The first answer `handler` has for `key`, or the unknown-identifier body.
async fn lookup_one(handler: &dyn crate::router::LocalHandler, key: &str) -> Response {
    match handler.lookup(&[key.to_string()]).await {
        Ok(values) => match values.into_iter().next() {
            Some(value) => Json(value).into_response(),
            None => unknown_identifier(key),
        },
        Err(e) => error_response(&e),
    }
}

async fn get_sensor(
    State(router): State<Arc<RequestRouter>>,
    Query(query): Query<SensorQuery>,
    request: Request<Body>,
) -> Response {
    let key = match single_key(query.sensorid) {
        Ok(key) => key,
        Err(e) => return error_response(&e),
    };

    if is_hop(request.headers()) {
        router.record(RouteKind::Local);
        return lookup_one(router.local_handler().as_ref(), &key).await;
    }

    match router.route(&key) {
        Ok(RouteDecision::Unknown) => {
            router.record(RouteKind::Unknown);
            match router.fallback() {
                Some(fallback) => lookup_one(fallback.as_ref(), &key).await,
                None => unknown_identifier(&key),
            }
        }
        Ok(RouteDecision::Owned {
            target: Target::Local,
            ..
        }) => {
            router.record(RouteKind::Local);
            lookup_one(router.local_handler().as_ref(), &key).await
        }
        Ok(RouteDecision::Owned {
            cluster,
            target: Target::Remote(base),
        }) => {
            if is_in_fleet(request.headers()) {
                debug!(%key, %cluster, %base, "redirecting in-fleet caller");
                router.record(RouteKind::Redirect);
                return proxy::redirect(&base, request.uri())
                    .unwrap_or_else(|e| error_response(&e));
            }
            router.record(RouteKind::Forward);
            match proxy::forward(&router, &base, request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(%key, %base, "forward failed: {}", e);
                    error_response(&e)
                }
            }
        }
        Err(e) => {
            router.record(RouteKind::Unavailable);
            error_response(&e)
        }
    }
}

async fn get_sensors(
    State(router): State<Arc<RequestRouter>>,
    Query(query): Query<SensorsQuery>,
    headers: HeaderMap,
) -> Response {
    let keys = parse_key_list(query.sensorids.as_deref().unwrap_or_default());
    if keys.is_empty() {
        return error_response(&Error::InvalidConfig("sensorids is required".into()));
    }
    if let Some(e) = keys.iter().find_map(|key| validate_key(key).err()) {
        return error_response(&e);
    }

    let result: Result<Vec<Value>> = if is_hop(&headers) {
        router.record(RouteKind::Local);
        router.local_handler().lookup(&keys).await
    } else {
        aggregate::aggregate(&router, &keys, header_request_id(&headers)).await
    };
    match result {
        Ok(values) => Json(values).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn ws_entry(
    State(router): State<Arc<RequestRouter>>,
    Query(query): Query<SensorQuery>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let hop = is_hop(&headers);
    let key = match query.sensorid {
        Some(raw) => match single_key(Some(raw)) {
            Ok(key) => Some(key),
            Err(e) => return error_response(&e),
        },
        None => None,
    };

    let decision = match (&key, hop) {
        (Some(key), false) => match router.route(key) {
            Ok(decision) => Some(decision),
            Err(e) => {
                router.record(RouteKind::Unavailable);
                return error_response(&e);
            }
        },
        _ => None,
    };

    // Redirects must happen before the upgrade is accepted.
    if let Some(RouteDecision::Owned {
        target: Target::Remote(base),
        ..
    }) = &decision
    {
        if is_in_fleet(&headers) {
            router.record(RouteKind::Redirect);
            return proxy::redirect(base, &uri).unwrap_or_else(|e| error_response(&e));
        }
    }

    let Some(upgrade) = upgrade else {
        return error_response(&Error::InvalidConfig(
            "websocket upgrade required".into(),
        ));
    };

    match (key, decision) {
        (Some(key), Some(RouteDecision::Unknown)) => {
            router.record(RouteKind::Unknown);
            upgrade.on_upgrade(move |socket| ws::serve_unknown(router, socket, key))
        }
        (Some(key), Some(RouteDecision::Owned { cluster, target })) => match target {
            Target::Local => {
                router.record(RouteKind::Local);
                upgrade.on_upgrade(move |socket| ws::serve_local(router, socket, vec![key], None))
            }
            Target::Remote(base) => {
                router.record(RouteKind::Forward);
                let group = crate::router::OwnerGroup {
                    cluster,
                    target: Target::Remote(base),
                    keys: vec![key],
                };
                upgrade.on_upgrade(move |socket| ws::serve_bridge(router, socket, group))
            }
        },
        (Some(key), None) => {
            router.record(RouteKind::Local);
            upgrade.on_upgrade(move |socket| ws::serve_local(router, socket, vec![key], None))
        }
        (None, _) => upgrade.on_upgrade(move |socket| ws::serve_inspected(router, socket, hop)),
    }
}
