//! Fleet node binary

use clap::{Parser, Subcommand};
use fleetcoord::common::parse_duration;
use fleetcoord::{CancelToken, Config, LockBackend, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetcoord-node")]
#[command(about = "fleetcoord node: leader election, gossip membership and request routing")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); FLEETCOORD_CONFIG is used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the fleet and serve requests
    Serve {
        /// Node name
        #[arg(long)]
        name: Option<String>,

        /// Service name
        #[arg(long)]
        service: Option<String>,

        /// Fleet (gossip cluster) name
        #[arg(long)]
        fleet: Option<String>,

        /// Ownership cluster served by this node
        #[arg(long)]
        cluster: Option<String>,

        /// Address peers use to reach this node
        #[arg(long)]
        private_ip: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        http: Option<SocketAddr>,

        /// HTTP port advertised to peers
        #[arg(long)]
        port: Option<u16>,

        /// Bind address for gossip
        #[arg(long)]
        gossip: Option<SocketAddr>,

        /// Gossip address advertised to peers
        #[arg(long)]
        advertise: Option<SocketAddr>,

        /// Directory holding the shared lease files
        #[arg(long)]
        lock_dir: Option<PathBuf>,

        /// Answer unknown keys from the local handler
        #[arg(long)]
        fallback_to_local: bool,

        /// How long to wait for the fleet leader (e.g. "30s", "2m")
        #[arg(long, value_parser = parse_duration)]
        startup_timeout: Option<Duration>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            name,
            service,
            fleet,
            cluster,
            private_ip,
            http,
            port,
            gossip,
            advertise,
            lock_dir,
            fallback_to_local,
            startup_timeout,
        } => {
            // CLI arguments win over file and environment values
            if let Some(name) = name {
                config.node.name = name;
            }
            if let Some(service) = service {
                config.node.service = service;
            }
            if let Some(fleet) = fleet {
                config.node.fleet = fleet;
            }
            if let Some(cluster) = cluster {
                config.node.cluster = cluster;
            }
            if let Some(ip) = private_ip {
                config.node.private_ip = ip;
            }
            if let Some(http) = http {
                config.node.http_addr = http;
                if port.is_none() {
                    config.node.port = http.port();
                }
            }
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(gossip) = gossip {
                config.gossip.bind_addr = gossip;
            }
            if advertise.is_some() {
                config.gossip.advertise_addr = advertise;
            }
            if let Some(dir) = lock_dir {
                config.election.lock_path = dir;
            }
            config.router.fallback_to_local |= fallback_to_local;
            if let Some(timeout) = startup_timeout {
                config.startup_timeout_secs = timeout.as_secs().max(1);
            }
            config.validate()?;

            let shutdown = CancelToken::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Shutdown requested");
                        shutdown.cancel();
                    }
                });
            }

            let locks = LockBackend::File(config.election.lock_path.clone());
            let node = Node::start(config, locks, &shutdown).await?;
            node.serve(shutdown).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
