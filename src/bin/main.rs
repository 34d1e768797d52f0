//! Protochain validator node.
//!
//! ```bash
//! protochain --config node.toml
//! protochain --config node.toml --genesis ./genesis.toml --data-dir /var/lib/protochain
//! ```
//!
//! Without an external transport the node runs against an in-process hub,
//! which is enough for a single-validator devnet.

use anyhow::Result;
use clap::Parser;
use protochain::{load_or_generate_signer, NodeConfig, StorageBackend, ValidatorNode};
use protochain_core::{MessageSigner, SystemClock};
use protochain_p2p::MemoryHub;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Protochain validator
#[derive(Parser, Debug)]
#[command(name = "protochain")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the node configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Genesis document (overrides config)
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Validator key seed file (overrides config)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long)]
    ephemeral: bool,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply_overrides(&self, config: &mut NodeConfig) {
        if let Some(ref genesis) = self.genesis {
            config.node.genesis_path = genesis.clone();
        }
        if let Some(ref data_dir) = self.data_dir {
            config.node.data_dir = data_dir.clone();
        }
        if let Some(ref key) = self.key {
            config.node.key_path = Some(key.clone());
        }
        if self.ephemeral {
            config.storage.backend = StorageBackend::Memory;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    info!(
        data_dir = %config.node.data_dir.display(),
        genesis = %config.node.genesis_path.display(),
        storage = ?config.storage.backend,
        "Node configuration loaded"
    );

    let signer = load_or_generate_signer(&config.key_path())?;
    let hub = MemoryHub::new();
    let transport = Arc::new(hub.connect(signer.public_key()));

    let node = ValidatorNode::start(&config, signer, transport, Arc::new(SystemClock))?;
    info!("Validator started, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");
    node.shutdown().await?;
    info!("Validator shutdown complete");
    Ok(())
}
