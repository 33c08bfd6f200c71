//! Affinity key → owner cluster table
//!
//! Local writes are visible to local readers at once and are queued for
//! gossip. Remote deltas and push/pull snapshots overwrite by key with no
//! version check: concurrent conflicting writes settle in whatever order
//! they arrive, so a delete racing an add on another node can come back.

use crate::common::Result;
use crate::membership::broadcast::{Action, BroadcastMessage, BroadcastQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

pub type Snapshot = HashMap<String, String>;

#[derive(Debug, Default)]
pub struct RoutingTable {
    items: Mutex<Snapshot>,
    broadcasts: Option<Arc<BroadcastQueue>>,
}

impl RoutingTable {
    /// Table whose local mutations are gossiped through `broadcasts`.
    pub fn new(broadcasts: Arc<BroadcastQueue>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            broadcasts: Some(broadcasts),
        }
    }

    /// Table that never broadcasts (single node, tests).
    pub fn standalone() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, value: &str) {
        self.items.lock().insert(key.to_string(), value.to_string());
        self.broadcast(BroadcastMessage::add(key, value));
    }

    /// Point every key at the same owner with a single broadcast.
    pub fn add_many(&self, keys: &[String], value: &str) {
        if keys.is_empty() {
            return;
        }
        {
            let mut items = self.items.lock();
            for key in keys {
                items.insert(key.clone(), value.to_string());
            }
        }
        self.broadcast(BroadcastMessage::add_many(keys.iter().cloned(), value));
    }

    /// Remove `key`, returning its previous owner.
    pub fn delete(&self, key: &str) -> Option<String> {
        let previous = self.items.lock().remove(key);
        // peers may still hold it even when we do not
        self.broadcast(BroadcastMessage::delete(key));
        previous
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    pub fn get_all(&self) -> Snapshot {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a delta received from a peer. Not re-broadcast.
    pub fn apply(&self, msg: &BroadcastMessage) {
        let mut items = self.items.lock();
        match msg.action {
            Action::Add => {
                for (key, value) in &msg.data {
                    items.insert(key.clone(), value.clone());
                }
            }
            Action::Delete => {
                for key in msg.data.keys() {
                    items.remove(key);
                }
            }
        }
    }

    /// Additive merge of a peer's full table: remote wins on every key.
    pub fn merge(&self, snapshot: Snapshot) {
        let count = snapshot.len();
        self.items.lock().extend(snapshot);
        debug!(entries = count, "merged remote routing state");
    }

    pub fn encode_snapshot(&self) -> Result<Vec<u8>> {
        let items = self.items.lock();
        Ok(serde_json::to_vec(&*items)?)
    }

    pub fn decode_snapshot(raw: &[u8]) -> Result<Snapshot> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn broadcast(&self, msg: BroadcastMessage) {
        let Some(queue) = &self.broadcasts else {
            return;
        };
        match msg.encode() {
            Ok(buf) => queue.enqueue(buf),
            Err(e) => error!("failed to encode routing broadcast: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::broadcast::split_kind;

    #[test]
    fn test_add_visible_immediately() {
        let table = RoutingTable::standalone();
        table.add("s-1", "east");
        assert_eq!(table.get("s-1").as_deref(), Some("east"));
        assert_eq!(table.get("s-2"), None);
    }

    #[test]
    fn test_mutations_are_broadcast() {
        let queue = Arc::new(BroadcastQueue::new(4));
        let table = RoutingTable::new(queue.clone());

        table.add("s-1", "east");
        table.add_many(&["s-2".to_string(), "s-3".to_string()], "west");
        assert_eq!(table.delete("s-1").as_deref(), Some("east"));
        assert_eq!(queue.len(), 3);

        let sent = queue.get_broadcasts(0, 64 * 1024);
        let actions: Vec<Action> = sent
            .iter()
            .map(|buf| {
                let (_, body) = split_kind(buf).unwrap();
                BroadcastMessage::decode(body).unwrap().action
            })
            .collect();
        assert_eq!(actions, vec![Action::Delete, Action::Add, Action::Add]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_apply_remote_delta_without_rebroadcast() {
        let queue = Arc::new(BroadcastQueue::new(4));
        let table = RoutingTable::new(queue.clone());

        table.apply(&BroadcastMessage::add_many(["a", "b"], "east"));
        assert_eq!(table.get("a").as_deref(), Some("east"));
        table.apply(&BroadcastMessage::delete("a"));
        assert_eq!(table.get("a"), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = RoutingTable::standalone();
        a.add("s-1", "east");
        a.add("s-2", "east");

        let b = RoutingTable::standalone();
        b.add("s-2", "west");
        b.add("s-3", "west");
        let snapshot = RoutingTable::decode_snapshot(&b.encode_snapshot().unwrap()).unwrap();

        a.merge(snapshot.clone());
        let once = a.get_all();
        a.merge(snapshot);
        assert_eq!(a.get_all(), once);

        // remote overwrites on conflict
        assert_eq!(once.get("s-2").map(String::as_str), Some("west"));
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_merge_can_resurrect_deleted_key() {
        let a = RoutingTable::standalone();
        a.add("s-1", "east");
        let stale = a.get_all();
        a.delete("s-1");

        a.merge(stale);
        assert_eq!(a.get("s-1").as_deref(), Some("east"));
    }
}
