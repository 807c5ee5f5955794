#![forbid(unsafe_code)]
//! TuCoin full node

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tucoin::config::load_config_from;
use tucoin::consensus::ConsensusKind;
use tucoin::network::split_node_id;
use tucoin::node::{init_tracing, Node};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// P2P listen port, overriding the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Peer to connect to at startup (host:port); may be repeated
    #[arg(long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,

    /// Produce blocks, paying rewards to this address
    #[arg(long, value_name = "ADDRESS")]
    mine: Option<String>,

    /// Consensus algorithm (pow or pos), overriding the configuration
    #[arg(long)]
    consensus: Option<ConsensusKind>,

    /// Disable LAN beacon discovery
    #[arg(long)]
    no_discovery: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config_from(&cli.config)?;
    if let Some(port) = cli.port {
        config.network.p2p_port = port;
    }
    for peer in cli.connect {
        if split_node_id(&peer).is_none() {
            warn!("Ignoring --connect {}: expected host:port", peer);
            continue;
        }
        if !config.network.bootstrap_peers.contains(&peer) {
            config.network.bootstrap_peers.push(peer);
        }
    }
    if let Some(address) = cli.mine {
        config.miner.enabled = true;
        config.miner.address = address;
    }
    if let Some(kind) = cli.consensus {
        config.consensus.algorithm = kind.to_string();
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }

    let node = Arc::new(Node::init(config).await?);
    node.start().await?;
    info!("Node {} running. Press Ctrl+C to stop.", node.network.node_id());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    node.shutdown().await?;
    Ok(())
}
