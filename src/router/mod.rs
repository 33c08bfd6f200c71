//! Affinity-keyed request routing
//!
//! Every request names one or more keys. Each key's owner cluster comes from
//! the routing table; the owner's address comes from a [`PeerResolver`].
//! From there a request is served locally, redirected (in-fleet callers),
//! forwarded (external callers), or split per owner and merged back.
//!
//! - `proxy`: redirect and reverse-proxy forwarding
//! - `aggregate`: multi-key HTTP fan-out
//! - `ws`: websocket sessions, including per-owner multiplexing
//! - `local`: the default ownership-reporting handler
//! - `http`: axum endpoints

pub mod aggregate;
pub mod http;
pub mod local;
pub mod proxy;
pub mod ws;

use crate::common::{Error, Metrics, Result, RouteKind, RouterConfig};
use crate::membership::{MembershipService, NodeMetadata};
use crate::routing::RoutingTable;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use local::OwnershipHandler;
pub use ws::{LocalSession, WsFrame};

pub use crate::common::tracing_middleware::FLEET_NODE_HEADER;

/// Marks a request as already routed once; it is always served locally.
pub const FLEET_HOP_HEADER: &str = "X-Fleet-Hop";

/// The service a node runs for the keys its cluster owns.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    /// Results for `keys`, one JSON value per key it knows about.
    async fn lookup(&self, keys: &[String]) -> Result<Vec<Value>>;

    /// Serve a streaming session until it ends or `session.cancel` fires.
    async fn stream(&self, session: LocalSession) -> Result<()>;
}

/// Maps an owner cluster to the HTTP base URL of a node serving it.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, service: &str, cluster: &str) -> Result<String>;
}

impl PeerResolver for MembershipService {
    fn resolve(&self, service: &str, cluster: &str) -> Result<String> {
        MembershipService::resolve(self, service, cluster)
    }
}

/// Fixed cluster → base URL map.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    peers: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, cluster: &str, base: &str) -> Self {
        self.peers.insert(cluster.to_string(), base.to_string());
        self
    }
}

impl PeerResolver for StaticResolver {
    fn resolve(&self, service: &str, cluster: &str) -> Result<String> {
        self.peers
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("{}/{}", service, cluster)))
    }
}

/// Where the owner of a key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    /// HTTP base URL of a peer
    Remote(String),
}

impl Target {
    /// Websocket base URL for a remote target.
    pub fn ws_base(&self) -> Option<String> {
        match self {
            Target::Local => None,
            Target::Remote(base) => Some(match base.strip_prefix("https://") {
                Some(rest) => format!("wss://{}", rest),
                None => base.replacen("http://", "ws://", 1),
            }),
        }
    }
}

/// Routing outcome for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Unknown,
    Owned { cluster: String, target: Target },
}

/// Keys sharing one owner, in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerGroup {
    pub cluster: String,
    pub target: Target,
    pub keys: Vec<String>,
}

/// Keys split by owner. `unknown` holds keys the table has no owner for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub owners: Vec<OwnerGroup>,
    pub unknown: Vec<String>,
}

pub struct RequestRouter {
    node_name: String,
    service: String,
    cluster: String,
    table: Arc<RoutingTable>,
    resolver: Arc<dyn PeerResolver>,
    local: Arc<dyn LocalHandler>,
    fallback: Option<Arc<dyn LocalHandler>>,
    client: reqwest::Client,
    config: RouterConfig,
    metrics: Arc<Metrics>,
}

impl RequestRouter {
    pub fn new(
        node: &NodeMetadata,
        table: Arc<RoutingTable>,
        resolver: Arc<dyn PeerResolver>,
        local: Arc<dyn LocalHandler>,
        config: &RouterConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            node_name: node.node_name.clone(),
            service: node.service_name.clone(),
            cluster: node.cluster_name.clone(),
            table,
            resolver,
            local,
            fallback: None,
            client,
            config: config.clone(),
            metrics,
        })
    }

    /// Serve keys the table does not know with `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn LocalHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn local_handler(&self) -> &Arc<dyn LocalHandler> {
        &self.local
    }

    pub fn fallback(&self) -> Option<&Arc<dyn LocalHandler>> {
        self.fallback.as_ref()
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Decide where `key` is served. Fails with [`Error::Unavailable`] when
    /// the owner is known but no peer serves it.
    pub fn route(&self, key: &str) -> Result<RouteDecision> {
        let Some(cluster) = self.table.get(key) else {
            return Ok(RouteDecision::Unknown);
        };
        let target = self.target_for(&cluster)?;
        Ok(RouteDecision::Owned { cluster, target })
    }

    fn target_for(&self, cluster: &str) -> Result<Target> {
        if cluster == self.cluster {
            return Ok(Target::Local);
        }
        self.resolver
            .resolve(&self.service, cluster)
            .map(Target::Remote)
    }

    /// Group `keys` by owner, owners ordered by first appearance.
    pub fn partition(&self, keys: &[String]) -> Result<Partition> {
        let mut partition = Partition::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        for key in keys {
            let Some(cluster) = self.table.get(key) else {
                partition.unknown.push(key.clone());
                continue;
            };
            match index.get(&cluster) {
                Some(&i) => partition.owners[i].keys.push(key.clone()),
                None => {
                    let target = self.target_for(&cluster)?;
                    index.insert(cluster.clone(), partition.owners.len());
                    partition.owners.push(OwnerGroup {
                        cluster,
                        target,
                        keys: vec![key.clone()],
                    });
                }
            }
        }
        Ok(partition)
    }

    pub(crate) fn local_group(&self, keys: Vec<String>) -> OwnerGroup {
        OwnerGroup {
            cluster: self.cluster.clone(),
            target: Target::Local,
            keys,
        }
    }

    pub(crate) fn record(&self, kind: RouteKind) {
        self.metrics.record_route(kind);
    }
}
