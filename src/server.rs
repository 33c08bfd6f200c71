//! Fleet node
//!
//! Wires configuration, the lease backend, membership, routing and the HTTP
//! surface together. Admin endpoints:
//!
//! - `POST /kv?key=&value=`: claim a key (value defaults to this node's cluster)
//! - `GET /kv?key=` / `GET /kv`: one entry / the whole table
//! - `DELETE /kv?key=`: drop a key everywhere
//! - `GET /node`: this node, the fleet leader and every member
//! - `GET /health`: liveness, failing when a stale leader stops renewing
//! - `GET /metrics`: Prometheus text

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{validate_key, CancelToken, Config, Metrics, Result};
use crate::election::LockBackend;
use crate::membership::{MembershipOptions, MembershipService};
use crate::router::http::error_response;
use crate::router::{LocalHandler, OwnershipHandler, RequestRouter};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

/// Shared state of the admin endpoints.
#[derive(Clone)]
pub struct NodeState {
    pub membership: Arc<MembershipService>,
    pub metrics: Arc<Metrics>,
    pub health_tolerance: Duration,
}

pub struct Node {
    config: Config,
    listener: TcpListener,
    http_addr: SocketAddr,
    membership: Arc<MembershipService>,
    router: Arc<RequestRouter>,
    metrics: Arc<Metrics>,
}

impl Node {
    /// Bind the HTTP listener, join the fleet and build the router around
    /// the default [`OwnershipHandler`].
    pub async fn start(config: Config, locks: LockBackend, parent: &CancelToken) -> Result<Self> {
        Self::start_with(config, locks, None, parent).await
    }

    /// Like [`Node::start`], serving owned keys with `handler` when given.
    pub async fn start_with(
        mut config: Config,
        locks: LockBackend,
        handler: Option<Arc<dyn LocalHandler>>,
        parent: &CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        info!("Starting fleet node: {}", config.node.name);
        info!("  Service: {} / fleet {}", config.node.service, config.node.fleet);
        info!("  Cluster: {}", config.node.cluster);
        info!("  HTTP: {}", config.node.http_addr);
        info!("  Gossip: {}", config.gossip.bind_addr);

        let listener = TcpListener::bind(config.node.http_addr).await?;
        let http_addr = listener.local_addr()?;
        if config.node.port == 0 {
            config.node.port = http_addr.port();
        }

        let metrics = Arc::new(Metrics::new());
        let options = MembershipOptions {
            hooks: None,
            metrics: Some(metrics.clone()),
        };
        let membership = MembershipService::start(&config, &locks, options, parent).await?;

        let local: Arc<dyn LocalHandler> = match handler {
            Some(handler) => handler,
            None => Arc::new(OwnershipHandler::new(membership.local())),
        };
        let mut router = RequestRouter::new(
            membership.local(),
            membership.table(),
            membership.clone(),
            local.clone(),
            &config.router,
            metrics.clone(),
        )?;
        if config.router.fallback_to_local {
            router = router.with_fallback(local);
        }

        Ok(Self {
            config,
            listener,
            http_addr,
            membership,
            router: Arc::new(router),
            metrics,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Routing and admin endpoints behind request tracing and a body limit.
    pub fn app(&self) -> Router {
        let state = NodeState {
            membership: self.membership.clone(),
            metrics: self.metrics.clone(),
            health_tolerance: self.config.election.health_tolerance(),
        };
        create_router(state)
            .merge(crate::router::http::create_router(self.router.clone()))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(request_tracing_middleware))
                    .layer(RequestBodyLimitLayer::new(self.config.router.body_limit_bytes)),
            )
    }

    /// Serve until `shutdown` fires, then leave the fleet.
    pub async fn serve(self, shutdown: CancelToken) -> Result<()> {
        let app = self.app();
        info!("✓ Fleet node ready on {}", self.http_addr);

        let signal = shutdown.clone();
        let served = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        if let Err(e) = self
            .membership
            .shutdown(self.config.gossip.leave_timeout())
            .await
        {
            error!("leaving fleet failed: {}", e);
        }
        info!("Fleet node stopped");
        Ok(served?)
    }
}

pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/kv", get(get_kv).post(put_kv).delete(delete_kv))
        .route("/node", get(node_info))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct KvQuery {
    key: Option<String>,
    value: Option<String>,
}

fn required_key(query: &KvQuery) -> std::result::Result<String, Response> {
    let key = query.key.clone().unwrap_or_default();
    validate_key(&key).map_err(|e| error_response(&e))?;
    Ok(key)
}

async fn put_kv(State(state): State<NodeState>, Query(query): Query<KvQuery>) -> Response {
    let key = match required_key(&query) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let value = query
        .value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| state.membership.local().cluster_name.clone());

    state.membership.table().add(&key, &value);
    info!(%key, %value, "routing entry set");
    (
        StatusCode::CREATED,
        Json(json!({ "status": "ok", "key": key, "value": value })),
    )
        .into_response()
}

async fn get_kv(State(state): State<NodeState>, Query(query): Query<KvQuery>) -> Response {
    let table = state.membership.table();
    let Some(key) = query.key else {
        return Json(table.get_all()).into_response();
    };
    match table.get(&key) {
        Some(value) => Json(json!({ "key": key, "value": value })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "not_found", "key": key })),
        )
            .into_response(),
    }
}

async fn delete_kv(State(state): State<NodeState>, Query(query): Query<KvQuery>) -> Response {
    let key = match required_key(&query) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.membership.table().delete(&key) {
        Some(previous) => {
            info!(%key, "routing entry deleted");
            Json(json!({ "status": "deleted", "key": key, "previous": previous })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "not_found", "key": key })),
        )
            .into_response(),
    }
}

async fn node_info(State(state): State<NodeState>) -> impl IntoResponse {
    let membership = &state.membership;
    let elector = membership.elector();
    Json(json!({
        "node": membership.local(),
        "gossip_addr": membership.advertise_addr(),
        "leader": elector.get_leader(),
        "is_leader": elector.is_leader(),
        "leader_transitions": elector.leader_transitions(),
        "members": membership.members(),
    }))
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    let elector = state.membership.elector();
    match elector.check(state.health_tolerance) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "is_leader": elector.is_leader(),
                "members": state.membership.members().len(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
    }
}

async fn metrics(State(state): State<NodeState>) -> impl IntoResponse {
    let membership = &state.membership;
    let broadcasts = membership.broadcasts();
    let gauges = [
        ("fleetcoord_members", membership.members().len() as u64),
        ("fleetcoord_broadcast_queue_depth", broadcasts.len() as u64),
        ("fleetcoord_broadcasts_queued_total", broadcasts.total_enqueued()),
        ("fleetcoord_routing_table_size", membership.table().len() as u64),
        (
            "fleetcoord_is_leader",
            u64::from(membership.elector().is_leader()),
        ),
    ];
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(&gauges),
    )
}
