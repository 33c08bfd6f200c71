//! CLI for fleet operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "fleetcoord")]
#[command(about = "fleetcoord admin CLI")]
#[command(version)]
struct Cli {
    /// Any fleet node's HTTP base URL
    #[arg(long, default_value = "http://localhost:8080")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a key to a cluster (the node's own cluster when omitted)
    Claim {
        key: String,

        #[arg(long)]
        cluster: Option<String>,
    },

    /// Show where a key is routed
    Route { key: String },

    /// Show the whole routing table
    Routes,

    /// Remove a key from the routing table
    Release { key: String },

    /// Show this node, the leader and the fleet members
    Members,

    /// Look up keys through the router (comma separated)
    Lookup { keys: String },

    /// Check node health
    Health,
}

async fn print_json(response: reqwest::Response) -> anyhow::Result<()> {
    let status = response.status();
    let body: Value = response.json().await.context("invalid JSON response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("request failed with status {}", status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = cli.node.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();
    let kv = format!("{}/kv", base);

    let response = match cli.command {
        Commands::Claim { key, cluster } => {
            let mut query = vec![("key", key)];
            if let Some(cluster) = cluster {
                query.push(("value", cluster));
            }
            client.post(&kv).query(&query).send().await?
        }
        Commands::Route { key } => client.get(&kv).query(&[("key", key)]).send().await?,
        Commands::Routes => client.get(&kv).send().await?,
        Commands::Release { key } => client.delete(&kv).query(&[("key", key)]).send().await?,
        Commands::Members => client.get(format!("{}/node", base)).send().await?,
        Commands::Lookup { keys } => {
            client
                .get(format!("{}/sensors", base))
                .query(&[("sensorids", keys)])
                .send()
                .await?
        }
        Commands::Health => client.get(format!("{}/health", base)).send().await?,
    };

    print_json(response).await
}
