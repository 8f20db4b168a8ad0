use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;

use tessera_consensus::{LocalLog, LogConfig};
use tessera_meta::{CompactionConfig, CompactionTask, MetaStore, WatchConfig};
use tessera_server::serve;
use tessera_storage::fjall::{FjallLogStorage, FjallStateMachine, FjallStore};
use tessera_storage::mem::{MemLogStorage, MemStateMachine};
use tessera_storage::{LogStorage, StateMachineStore};

#[derive(clap::Parser, Debug)]
#[command(name = "tessera-node", about = "Tessera meta store node")]
struct Cli {
    #[arg(long)]
    node_id: u64,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Keep all state in memory; nothing survives a restart.
    #[arg(long)]
    in_memory: bool,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    log: LogConfig,
    watch: WatchConfig,
    compaction: CompactionConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("TESSERA_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;

    if cli.in_memory {
        tracing::info!(node_id = cli.node_id, %client_addr, "node starting in memory");
        return run(cli.node_id, client_addr, &config, MemLogStorage::new(), MemStateMachine::default()).await;
    }

    let data_dir = cli.data_dir.unwrap_or_else(|| config.storage.data_dir.clone());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    tracing::info!(node_id = cli.node_id, %client_addr, data_dir = %data_dir.display(), "node starting");

    let store = FjallStore::open(&data_dir)
        .with_context(|| format!("failed to open storage at {}", data_dir.display()))?;
    run(
        cli.node_id,
        client_addr,
        &config,
        FjallLogStorage(store.clone()),
        FjallStateMachine::new(store),
    )
    .await
}

async fn run<L: LogStorage, S: StateMachineStore>(
    node_id: u64,
    client_addr: SocketAddr,
    config: &Config,
    log: L,
    sm: S,
) -> anyhow::Result<()> {
    let log = LocalLog::open(log, sm, config.log.clone())
        .await
        .context("failed to open replicated log")?;
    let store = MetaStore::new(Arc::new(log), config.watch.clone());
    tracing::info!(revision = store.revision(), "meta store ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let compaction = CompactionTask::new(store.clone(), config.compaction.clone()).spawn(shutdown_rx);

    let signal = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    let served = serve(client_addr, store.clone(), node_id, signal).await;

    let _ = shutdown_tx.send(true);
    store.dispatcher().shutdown();
    compaction.await.context("compaction task failed")?;
    tracing::info!("node stopped");
    served
}
