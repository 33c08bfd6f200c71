//! Callbacks a gossip transport drives, and the node-side implementation
//!
//! `ClusterDelegate` binds both delegate traits to the routing table, the
//! broadcast queue and the node directory. It never touches the table and
//! the directory under the same lock.

use crate::common::Metrics;
use crate::membership::broadcast::{split_kind, BroadcastMessage, BroadcastQueue, MessageKind};
use crate::membership::metadata::NodeMetadata;
use crate::membership::transport::Member;
use crate::routing::RoutingTable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Application payload hooks.
pub trait MessageDelegate: Send + Sync {
    /// Metadata advertised for the local node, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived from a peer.
    fn notify_msg(&self, msg: &[u8]);

    /// Broadcasts to piggyback on the next gossip message.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state sent during push/pull.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Merge a peer's full state received during push/pull.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change hooks.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, member: &Member);
    fn notify_leave(&self, member: &Member);
    fn notify_update(&self, member: &Member);
}

/// The pair of delegates handed to a transport at creation.
#[derive(Clone)]
pub struct Delegates {
    pub messages: Arc<dyn MessageDelegate>,
    pub events: Arc<dyn EventDelegate>,
}

impl Delegates {
    /// Use one value for both roles.
    pub fn from_shared<D>(delegate: Arc<D>) -> Self
    where
        D: MessageDelegate + EventDelegate + 'static,
    {
        Self {
            messages: delegate.clone(),
            events: delegate,
        }
    }
}

/// Application hooks for peers joining and leaving.
pub trait MembershipHooks: Send + Sync {
    fn on_node_join(&self, _node: &NodeMetadata) {}
    fn on_node_leave(&self, _node: &NodeMetadata) {}
}

/// Metadata of every known node, keyed by node name.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: Mutex<HashMap<String, NodeMetadata>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns true when the node was new.
    pub fn upsert(&self, meta: NodeMetadata) -> bool {
        self.nodes
            .lock()
            .insert(meta.node_name.clone(), meta)
            .is_none()
    }

    pub fn remove(&self, name: &str) -> Option<NodeMetadata> {
        self.nodes.lock().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<NodeMetadata> {
        self.nodes.lock().get(name).cloned()
    }

    /// First node serving `cluster` for `service`, by node name.
    pub fn find(&self, service: &str, cluster: &str) -> Option<NodeMetadata> {
        let nodes = self.nodes.lock();
        let mut matching: Vec<&NodeMetadata> = nodes
            .values()
            .filter(|m| m.serves(service, cluster))
            .collect();
        matching.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        matching.first().map(|m| (*m).clone())
    }

    pub fn list(&self) -> Vec<NodeMetadata> {
        let mut nodes: Vec<NodeMetadata> = self.nodes.lock().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delegate implementation shared by every node.
pub struct ClusterDelegate {
    local: NodeMetadata,
    table: Arc<RoutingTable>,
    broadcasts: Arc<BroadcastQueue>,
    directory: Arc<NodeDirectory>,
    hooks: Option<Arc<dyn MembershipHooks>>,
    metrics: Option<Arc<Metrics>>,
}

impl ClusterDelegate {
    pub fn new(
        local: NodeMetadata,
        table: Arc<RoutingTable>,
        broadcasts: Arc<BroadcastQueue>,
        directory: Arc<NodeDirectory>,
    ) -> Self {
        Self {
            local,
            table,
            broadcasts,
            directory,
            hooks: None,
            metrics: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn MembershipHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn decode_member(member: &Member) -> Option<NodeMetadata> {
        if member.meta.is_empty() {
            warn!(node = %member.name, "member advertised no metadata");
            return None;
        }
        match NodeMetadata::decode(&member.meta) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(node = %member.name, "undecodable member metadata: {}", e);
                None
            }
        }
    }

    fn track(&self, member: &Member) {
        let Some(meta) = Self::decode_member(member) else {
            return;
        };
        let is_new = self.directory.upsert(meta.clone());
        self.broadcasts.set_num_nodes(self.directory.len());
        if is_new {
            info!(
                node = %meta.node_name,
                cluster = %meta.cluster_name,
                addr = %member.addr,
                "node joined"
            );
        } else {
            debug!(node = %meta.node_name, "node metadata updated");
        }
        if let Some(hooks) = &self.hooks {
            hooks.on_node_join(&meta);
        }
    }
}

impl MessageDelegate for ClusterDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        match self.local.encode(limit) {
            Ok(raw) => raw,
            Err(e) => {
                error!("dropping node metadata: {}", e);
                Vec::new()
            }
        }
    }

    fn notify_msg(&self, msg: &[u8]) {
        let (kind, body) = match split_kind(msg) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("dropping gossip message: {}", e);
                return;
            }
        };
        match kind {
            MessageKind::RoutingUpdate => match BroadcastMessage::decode(body) {
                Ok(update) => {
                    self.table.apply(&update);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_broadcast_received();
                    }
                }
                Err(e) => warn!("undecodable routing update: {}", e),
            },
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        match self.table.encode_snapshot() {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to encode routing snapshot: {}", e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            return;
        }
        match RoutingTable::decode_snapshot(buf) {
            Ok(snapshot) => {
                debug!(entries = snapshot.len(), join, "merging remote state");
                self.table.merge(snapshot);
            }
            Err(e) => warn!("undecodable remote state: {}", e),
        }
    }
}

impl EventDelegate for ClusterDelegate {
    fn notify_join(&self, member: &Member) {
        self.track(member);
    }

    fn notify_leave(&self, member: &Member) {
        let removed = self
            .directory
            .remove(&member.name)
            .or_else(|| Self::decode_member(member));
        self.broadcasts.set_num_nodes(self.directory.len());
        info!(node = %member.name, addr = %member.addr, "node left");
        if let (Some(hooks), Some(meta)) = (&self.hooks, removed) {
            hooks.on_node_leave(&meta);
        }
    }

    fn notify_update(&self, member: &Member) {
        self.track(member);
    }
}
