//! # fleetcoord
//!
//! Coordination for fleets of service nodes:
//! - Lease-based leader election over a pluggable lock
//! - Gossip membership bootstrapped through the elected leader
//! - A gossip-replicated routing table mapping affinity keys to clusters
//! - Request routing: serve, redirect, forward, or split per owner
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            lease "{service}/{fleet}"
//!        ┌──────────────┴──────────────┐
//!  ┌─────▼──────┐  gossip (TCP)  ┌─────▼──────┐
//!  │  node A    │◄──────────────►│  node B    │
//!  │ (leader /  │  routing table │            │
//!  │   seed)    │     deltas     │            │
//!  └─────┬──────┘                └─────┬──────┘
//!        │ HTTP / WS                   │ HTTP / WS
//!   clients: /sensor, /sensors, /ws ───┘ redirect, forward, fan-out
//! ```
//!
//! ## Usage
//!
//! ### Start nodes
//! ```bash
//! fleetcoord-node serve --name gw-1 --cluster east \
//!   --http 0.0.0.0:8080 --gossip 0.0.0.0:7946 --lock-dir /shared/locks
//! fleetcoord-node serve --name gw-2 --cluster west \
//!   --http 0.0.0.0:8081 --gossip 0.0.0.0:7947 --lock-dir /shared/locks
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Claim a key for the node's cluster, or name one
//! fleetcoord claim s-1 --node http://localhost:8080
//! fleetcoord claim s-2 --cluster west
//!
//! # Inspect
//! fleetcoord routes
//! fleetcoord members
//! fleetcoord lookup s-1,s-2
//! ```

pub mod common;
pub mod election;
pub mod membership;
pub mod router;
pub mod routing;
pub mod server;

// Re-export commonly used types
pub use common::{CancelToken, Config, Error, Result};
pub use election::{LeaderCallbacks, LeaderElector, LockBackend};
pub use membership::MembershipService;
pub use router::{LocalHandler, RequestRouter};
pub use routing::RoutingTable;
pub use server::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
