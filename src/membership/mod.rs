//! Fleet membership over gossip
//!
//! - `metadata`: what each node advertises about itself
//! - `broadcast`: routing deltas and the retransmit-limited queue
//! - `delegate`: transport callbacks and the node directory
//! - `transport`: the gossip transport contract
//! - `tcp`: SWIM-style TCP implementation of that contract
//! - `service`: leader-driven bootstrap and the public membership API

pub mod broadcast;
pub mod delegate;
pub mod metadata;
pub mod service;
pub mod tcp;
pub mod transport;

pub use broadcast::{Action, BroadcastMessage, BroadcastQueue, MessageKind};
pub use delegate::{
    ClusterDelegate, Delegates, EventDelegate, MembershipHooks, MessageDelegate, NodeDirectory,
};
pub use metadata::{NodeMetadata, META_MAX_SIZE};
pub use service::{MemberInfo, MembershipOptions, MembershipService};
pub use tcp::TcpGossip;
pub use transport::{GossipTransport, Member, MemberState};
