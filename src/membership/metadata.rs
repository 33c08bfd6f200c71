//! Per-node metadata advertised through the gossip handshake

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hard ceiling the transport places on the metadata blob
pub const META_MAX_SIZE: usize = 512;

/// What a node tells its peers about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_name: String,
    pub service_name: String,
    pub private_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_ip: String,
    pub cluster_name: String,
    pub port: u16,
    #[serde(default)]
    pub capacity: u32,
}

impl NodeMetadata {
    /// Base URL peers use to reach this node's HTTP surface.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.private_ip, self.port)
    }

    /// Websocket base URL for the same surface.
    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.private_ip, self.port)
    }

    /// Does this node serve `cluster` for `service`?
    pub fn serves(&self, service: &str, cluster: &str) -> bool {
        self.service_name == service && self.cluster_name == cluster
    }

    /// Serialize within `limit` bytes.
    pub fn encode(&self, limit: usize) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(self)?;
        if raw.len() > limit {
            return Err(Error::MetadataTooLarge {
                size: raw.len(),
                limit,
            });
        }
        Ok(raw)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
