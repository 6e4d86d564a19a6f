//! Braid gossip node binary.
//!
//! Opens RocksDB message storage and runs the admission pipeline. The peer
//! transport is external: this binary logs outbound peer commands and keeps
//! the inbound event channel open, so it is mostly useful for importing and
//! validating message dumps.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use braid_core::types::Message;
use braid_node_lib::{Node, NodeConfig, PeerCommand};

/// Braid gossip node.
#[derive(Parser, Debug)]
#[command(
    name = "braid-node",
    version,
    about = "Braid gossip node with RocksDB message storage"
)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for message storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Network name; the network id is derived from it
    #[arg(long)]
    network: Option<String>,

    /// Start from the public test network presets; the config file and
    /// environment still apply on top
    #[arg(long)]
    testnet: bool,

    /// Minimum anti-spam score for accepted messages
    #[arg(long)]
    min_score: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// File of hex-encoded messages, one per line, emitted at startup
    #[arg(long)]
    import: Option<PathBuf>,
}

impl Args {
    /// Build the node configuration: presets, file and environment, then flags.
    fn to_config(&self) -> Result<NodeConfig> {
        let path = self.config.as_deref();
        let loaded = if self.testnet {
            NodeConfig::load_testnet(path)
        } else {
            NodeConfig::load(path)
        };
        let mut config = match path {
            Some(path) => loaded.with_context(|| format!("failed to load config {}", path.display()))?,
            None => loaded.context("failed to load config from environment")?,
        };

        if let Some(network) = &self.network {
            config.set_network(network.clone());
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(min_score) = self.min_score {
            config.gossip.min_score = min_score;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.to_config()?;

    init_logging(&config.log_level, &args.log_format);

    info!("Braid node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {} ({})", config.network_name, config.gossip.network_id);
    info!("data_dir: {:?}", config.data_dir);

    let (node, handle) = Node::new(config).context("failed to start node")?;
    // Keep the inbound side open; without a transport nothing is delivered.
    let _events = handle.events;
    tokio::spawn(log_commands(handle.commands));

    if let Some(path) = &args.import {
        import_messages(&node, path).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run(shutdown_rx).await })
    };

    info!("Braid node running (Ctrl+C to stop)");
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down...");

    let _ = shutdown_tx.send(true);
    runner.await.context("node task failed")?;

    let metrics = node.metrics();
    info!(
        received = metrics.messages_received,
        accepted = metrics.accepted,
        rejected = metrics.rejected(),
        "Braid node shutdown complete"
    );
    Ok(())
}

/// Emit every hex-encoded message in `path`, logging each outcome.
async fn import_messages(node: &Node, path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read import file {}", path.display()))?;

    let (mut ok, mut failed) = (0usize, 0usize);
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = index + 1;

        let message = match hex::decode(line).map_err(anyhow::Error::from).and_then(|bytes| {
            Message::from_bytes(&bytes).map_err(anyhow::Error::from)
        }) {
            Ok(message) => message,
            Err(e) => {
                warn!(line = lineno, "import: unparseable message: {e}");
                failed += 1;
                continue;
            }
        };

        match node.emit(message).await {
            Ok(id) => {
                info!(line = lineno, %id, "import: accepted");
                ok += 1;
            }
            Err(e) => {
                warn!(line = lineno, "import: {e}");
                failed += 1;
            }
        }
    }

    info!(ok, failed, "import finished");
    Ok(())
}

/// Stand-in for a transport: log what the node wants sent.
async fn log_commands(mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            PeerCommand::RequestMessage { id, peers } => {
                debug!(%id, peers = peers.len(), "peer command: request message");
            }
            PeerCommand::SendMessage { peer, bytes } => {
                debug!(%peer, len = bytes.len(), "peer command: send message");
            }
            PeerCommand::Broadcast { bytes, exclude } => {
                debug!(len = bytes.len(), exclude = exclude.len(), "peer command: broadcast");
            }
        }
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
