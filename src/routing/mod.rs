//! Ownership routing table replicated by gossip

pub mod table;

pub use table::{RoutingTable, Snapshot};
