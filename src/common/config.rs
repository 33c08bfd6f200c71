//! Configuration for fleetcoord nodes
//!
//! Values come from (lowest to highest priority) built-in defaults, an
//! optional TOML file, and `FLEETCOORD__SECTION__FIELD` environment
//! variables. The node binary applies CLI overrides on top.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "FLEETCOORD_CONFIG";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "FLEETCOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub election: ElectionConfig,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub router: RouterConfig,

    /// How long to wait for the bootstrap leader before giving up
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            election: ElectionConfig::default(),
            gossip: GossipConfig::default(),
            router: RouterConfig::default(),
            startup_timeout_secs: default_startup_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from `FLEETCOORD_CONFIG` when unset.
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that could never produce a working node.
    pub fn validate(&self) -> Result<()> {
        crate::election::validate_timing(
            self.election.lease_duration(),
            self.election.renew_deadline(),
            self.election.retry_period(),
        )?;
        if self.node.name.is_empty() {
            return Err(Error::InvalidConfig("node.name cannot be empty".into()));
        }
        if self.node.cluster.is_empty() {
            return Err(Error::InvalidConfig("node.cluster cannot be empty".into()));
        }
        if self.gossip.retransmit_mult == 0 {
            return Err(Error::InvalidConfig(
                "gossip.retransmit_mult must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Identity and addressing of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name within the fleet
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Service this node belongs to
    #[serde(default = "default_service")]
    pub service: String,

    /// Logical gossip cluster (scopes the bootstrap lease)
    #[serde(default = "default_fleet")]
    pub fleet: String,

    /// Ownership cluster this node serves; routing entries point here
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Address reachable from inside the fleet
    #[serde(default = "default_private_ip")]
    pub private_ip: String,

    /// Address reachable from outside the fleet (informational)
    #[serde(default)]
    pub public_ip: String,

    /// Bind address for the HTTP surface
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// HTTP port advertised to peers
    #[serde(default = "default_port")]
    pub port: u16,

    /// Declared capacity (opaque to the router)
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_node_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}
fn default_service() -> String {
    "sensor-gateway".to_string()
}
fn default_fleet() -> String {
    "default".to_string()
}
fn default_cluster() -> String {
    "local".to_string()
}
fn default_private_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_port() -> u16 {
    8080
}
fn default_capacity() -> u32 {
    100
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            service: default_service(),
            fleet: default_fleet(),
            cluster: default_cluster(),
            private_ip: default_private_ip(),
            public_ip: String::new(),
            http_addr: default_http_addr(),
            port: default_port(),
            capacity: default_capacity(),
        }
    }
}

/// Lease timing and lock backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default = "default_lease_duration")]
    pub lease_duration_ms: u64,

    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_ms: u64,

    #[serde(default = "default_retry_period")]
    pub retry_period_ms: u64,

    /// Give the lease up on shutdown instead of letting it expire
    #[serde(default = "default_true")]
    pub release_on_cancel: bool,

    /// Directory holding lease files (shared filesystem)
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Extra slack granted to a leader before `/health` reports it stale
    #[serde(default = "default_health_tolerance")]
    pub health_tolerance_ms: u64,
}

fn default_lease_duration() -> u64 {
    15_000
}
fn default_renew_deadline() -> u64 {
    10_000
}
fn default_retry_period() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}
fn default_lock_path() -> PathBuf {
    PathBuf::from("./fleetcoord-locks")
}
fn default_health_tolerance() -> u64 {
    20_000
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration(),
            renew_deadline_ms: default_renew_deadline(),
            retry_period_ms: default_retry_period(),
            release_on_cancel: true,
            lock_path: default_lock_path(),
            health_tolerance_ms: default_health_tolerance(),
        }
    }
}

impl ElectionConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
    pub fn renew_deadline(&self) -> Duration {
        Duration::from_millis(self.renew_deadline_ms)
    }
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }
    pub fn health_tolerance(&self) -> Duration {
        Duration::from_millis(self.health_tolerance_ms)
    }
}

/// Gossip transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Bind address for gossip traffic
    #[serde(default = "default_gossip_bind")]
    pub bind_addr: SocketAddr,

    /// Address advertised to peers (defaults to the bound address)
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Peers contacted per gossip round
    #[serde(default = "default_gossip_nodes")]
    pub gossip_nodes: usize,

    #[serde(default = "default_push_pull_interval")]
    pub push_pull_interval_ms: u64,

    /// Time a suspect peer has to refute before it is declared dead
    #[serde(default = "default_suspicion_timeout")]
    pub suspicion_timeout_ms: u64,

    /// Bound on every gossip TCP exchange (dial + write + read)
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_ms: u64,

    /// Broadcast retransmit multiplier
    #[serde(default = "default_retransmit_mult")]
    pub retransmit_mult: usize,

    #[serde(default = "default_leave_timeout")]
    pub leave_timeout_ms: u64,
}

fn default_gossip_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}
fn default_probe_interval() -> u64 {
    1_000
}
fn default_gossip_interval() -> u64 {
    200
}
fn default_gossip_nodes() -> usize {
    3
}
fn default_push_pull_interval() -> u64 {
    30_000
}
fn default_suspicion_timeout() -> u64 {
    5_000
}
fn default_tcp_timeout() -> u64 {
    3_000
}
fn default_retransmit_mult() -> usize {
    4
}
fn default_leave_timeout() -> u64 {
    5_000
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_gossip_bind(),
            advertise_addr: None,
            probe_interval_ms: default_probe_interval(),
            gossip_interval_ms: default_gossip_interval(),
            gossip_nodes: default_gossip_nodes(),
            push_pull_interval_ms: default_push_pull_interval(),
            suspicion_timeout_ms: default_suspicion_timeout(),
            tcp_timeout_ms: default_tcp_timeout(),
            retransmit_mult: default_retransmit_mult(),
            leave_timeout_ms: default_leave_timeout(),
        }
    }
}

impl GossipConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
    pub fn push_pull_interval(&self) -> Duration {
        Duration::from_millis(self.push_pull_interval_ms)
    }
    pub fn suspicion_timeout(&self) -> Duration {
        Duration::from_millis(self.suspicion_timeout_ms)
    }
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }
    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

/// Request routing timeouts and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bound on forwarded and fan-out HTTP calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Bound on dialing a peer (HTTP or websocket)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long a websocket session may stay silent before its first frame
    #[serde(default = "default_first_frame_timeout")]
    pub first_frame_timeout_ms: u64,

    /// Maximum request body forwarded to a peer
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Serve unknown identifiers locally instead of answering "unknown"
    #[serde(default)]
    pub fallback_to_local: bool,
}

fn default_request_timeout() -> u64 {
    10_000
}
fn default_connect_timeout() -> u64 {
    3_000
}
fn default_first_frame_timeout() -> u64 {
    5_000
}
fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            first_frame_timeout_ms: default_first_frame_timeout(),
            body_limit_bytes: default_body_limit(),
            fallback_to_local: false,
        }
    }
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }
}
