//! The gossip transport contract the membership service consumes

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberState {
    pub fn is_live(self) -> bool {
        matches!(self, MemberState::Alive | MemberState::Suspect)
    }

    /// Ordering used to break ties at equal incarnation.
    pub(crate) fn severity(self) -> u8 {
        match self {
            MemberState::Alive => 0,
            MemberState::Suspect => 1,
            MemberState::Dead => 2,
            MemberState::Left => 3,
        }
    }
}

/// A peer as the transport sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Advertised gossip address
    pub addr: SocketAddr,
    /// Opaque metadata blob supplied by the peer's `MessageDelegate`
    pub meta: Vec<u8>,
    pub state: MemberState,
    pub incarnation: u64,
}

#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Contact each address and exchange full state. Returns how many
    /// succeeded; fails only when none did.
    async fn join(&self, addrs: &[String]) -> Result<usize>;

    /// Live members, the local node included.
    fn members(&self) -> Vec<Member>;

    fn local_member(&self) -> Member;

    /// Announce departure and stop gossiping, bounded by `timeout`.
    async fn leave(&self, timeout: Duration) -> Result<()>;

    /// Stop background tasks without announcing anything.
    async fn shutdown(&self);
}
