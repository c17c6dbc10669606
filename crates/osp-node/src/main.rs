//! OSP node entry point.
//!
//! Runs one node against an in-process simulated ledger chain, with peers
//! reached over HTTP.

use clap::Parser;
use osp_crypto::KeyPair;
use osp_node::config::StorageBackend;
use osp_node::{HttpTransport, Node, OspConfig, PeerTransport};
use osp_settlement::{LedgerChain, SimulatedChain, SimulatedChainConfig};
use osp_store::{MemoryStore, RocksStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// OSP payment channel node
#[derive(Parser, Debug)]
#[command(name = "osp-node", version, about = "OSP payment channel node")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "osp.toml")]
    config: PathBuf,

    /// Override the API port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Block time of the simulated chain, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    block_time_ms: u64,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init {
        init_tracing(args.log_level.as_deref().unwrap_or("info"), "text");
        let config = OspConfig::default();
        config.save(&args.config)?;
        tracing::info!(path = %args.config.display(), "wrote default config");
        return Ok(());
    }

    let mut config = OspConfig::load(&args.config)?;
    if let Some(api_port) = args.api_port {
        config.api.port = api_port;
    }
    if let Some(ref data_dir) = args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_tracing(&config.logging.level, &config.logging.format);

    tracing::info!("OSP node v{}", env!("CARGO_PKG_VERSION"));

    let keypair = Arc::new(KeyPair::load_or_generate(&config.keypair_path())?);
    let store: Arc<dyn Store> = match config.storage.backend {
        StorageBackend::Rocksdb => Arc::new(RocksStore::open(&config.storage.data_dir.join("db"))?),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    let chain = Arc::new(SimulatedChain::new(SimulatedChainConfig {
        ledger: config.chain.ledger,
        ..SimulatedChainConfig::default()
    }));
    let miner = chain.clone().spawn_miner(Duration::from_millis(args.block_time_ms.max(1)));
    let transport: Arc<dyn PeerTransport> = Arc::new(HttpTransport::new(
        keypair.address(),
        &config.peers,
        config.payment.peer_timeout(),
    )?);

    let chain: Arc<dyn LedgerChain> = chain;
    let node = Node::new(config, keypair, store, chain, transport)?;
    node.start();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("received shutdown signal");
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = shutdown => {
            tracing::info!("initiating graceful shutdown");
        }
    }

    node.shutdown().await;
    miner.abort();
    tracing::info!("OSP node exited cleanly");
    Ok(())
}
