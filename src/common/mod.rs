//! Common utilities and types shared across fleetcoord

pub mod config;
pub mod error;
pub mod metrics;
pub mod shutdown;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, ElectionConfig, GossipConfig, NodeConfig, RouterConfig};
pub use error::{Error, Result};
pub use metrics::{Metrics, RouteKind};
pub use shutdown::CancelToken;
pub use utils::{jitter, parse_duration, parse_key_list, validate_key, JITTER_FACTOR};
