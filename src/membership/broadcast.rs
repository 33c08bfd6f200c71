//! Routing deltas and the retransmit-limited queue that gossips them
//!
//! A queued broadcast is piggybacked on gossip rounds until it has been sent
//! `retransmit_mult * ceil(log10(n + 1))` times for `n` known nodes, then
//! dropped. Nothing guarantees every peer sees it; push/pull sync repairs
//! what gets lost.

use crate::common::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Upper bound on queued broadcasts; the most-sent ones go first.
pub const DEFAULT_MAX_QUEUED: usize = 4096;

/// One-byte prefix identifying a user message on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RoutingUpdate = 1,
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::RoutingUpdate),
            other => Err(Error::Transport(format!("unknown message kind {}", other))),
        }
    }
}

/// Split a received user message into its kind and body.
pub fn split_kind(buf: &[u8]) -> Result<(MessageKind, &[u8])> {
    let (&kind, body) = buf
        .split_first()
        .ok_or_else(|| Error::Transport("empty message".into()))?;
    Ok((MessageKind::try_from(kind)?, body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Delete,
}

/// A routing table delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub action: Action,
    pub data: BTreeMap<String, String>,
}

impl BroadcastMessage {
    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), value.into());
        Self {
            action: Action::Add,
            data,
        }
    }

    pub fn add_many<I, K>(keys: I, value: &str) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            action: Action::Add,
            data: keys
                .into_iter()
                .map(|k| (k.into(), value.to_string()))
                .collect(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), String::new());
        Self {
            action: Action::Delete,
            data,
        }
    }

    /// Kind-prefixed wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![MessageKind::RoutingUpdate as u8];
        serde_json::to_writer(&mut buf, self)?;
        Ok(buf)
    }

    /// Decode a body whose kind prefix was already stripped.
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Number of times each broadcast is sent for a cluster of `num_nodes`.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    retransmit_mult * scale
}

#[derive(Debug)]
struct Queued {
    id: u64,
    payload: Vec<u8>,
    transmits: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: Vec<Queued>,
    next_id: u64,
}

/// Retransmit-limited broadcast queue.
#[derive(Debug)]
pub struct BroadcastQueue {
    retransmit_mult: usize,
    max_queued: usize,
    num_nodes: AtomicUsize,
    inner: Mutex<QueueInner>,
    enqueued: AtomicU64,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: usize) -> Self {
        Self::with_capacity(retransmit_mult, DEFAULT_MAX_QUEUED)
    }

    pub fn with_capacity(retransmit_mult: usize, max_queued: usize) -> Self {
        Self {
            retransmit_mult,
            max_queued: max_queued.max(1),
            num_nodes: AtomicUsize::new(1),
            inner: Mutex::new(QueueInner::default()),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Cluster size (including this node) used for the retransmit limit.
    pub fn set_num_nodes(&self, n: usize) {
        self.num_nodes.store(n.max(1), Ordering::Relaxed);
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes.load(Ordering::Relaxed)
    }

    pub fn enqueue(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push(Queued {
            id,
            payload,
            transmits: 0,
        });
        if inner.items.len() > self.max_queued {
            // keep the freshest: drop the most transmitted, oldest first
            inner
                .items
                .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));
            let max = self.max_queued;
            inner.items.truncate(max);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Pick broadcasts for one gossip message of at most `limit` bytes, each
    /// costing `overhead` extra bytes of framing. Least-sent (then newest)
    /// broadcasts go first.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, self.num_nodes());
        let mut inner = self.inner.lock();
        inner
            .items
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

        let mut used = 0;
        let mut out = Vec::new();
        for item in inner.items.iter_mut() {
            let cost = overhead + item.payload.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            item.transmits += 1;
            out.push(item.payload.clone());
        }
        inner.items.retain(|item| item.transmits < transmit_limit);
        out
    }

    /// Broadcasts still waiting to be (re)sent.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total broadcasts ever queued.
    pub fn total_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
}
