// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Node
//!
//! Entry point for the `tessera-node` binary. Parses CLI arguments,
//! initializes logging and metrics, then drives the node through its
//! lifecycle: connect to bootnodes, catch up with the committee, and keep
//! running until a shutdown signal arrives.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the node
//! - `init`    — create a data directory, node key and starter config
//! - `version` — print build version information

mod cli;
mod logging;
mod metrics;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use tessera_protocol::config::{SocketPorts, PROTOCOL_VERSION};
use tessera_protocol::crypto::keys::Wallet;
use tessera_protocol::network::{
    CatchupHandler, CatchupNetwork, CredentialsProvider, Lifecycle, Network, NodeEvent, NodeState,
};
use tessera_protocol::storage::{Block, BlockStorage, ChainDb, StateDriver};

use cli::{Commands, TesseraNodeCli};
use logging::LogFormat;
use metrics::{NodeMetrics, SharedMetrics};
use settings::NodeSettings;

const KEY_FILE: &str = "node.key";
const CONFIG_FILE: &str = "config.toml";

/// How long `Connecting` waits for a bootnode to complete its hello.
const CONNECT_GRACE: Duration = Duration::from_secs(15);

/// Pause after a failed catchup before going back to `Connecting`.
const CATCHUP_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TesseraNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Everything the lifecycle steps need.
struct NodeContext {
    network: Arc<Network>,
    db: ChainDb,
    settings: NodeSettings,
    metrics: SharedMetrics,
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "tessera_node=info,tessera_protocol=info",
        LogFormat::from(args.log_format),
    );

    let mut settings = load_settings(args.config.as_deref(), &args.data_dir)?;
    if let Some(port) = args.router_port {
        settings.network.socket_ports = SocketPorts::from_base(port);
    }
    if let Some(port) = args.metrics_port {
        settings.metrics_port = Some(port);
    }
    settings.validate()?;

    let wallet = Arc::new(load_wallet(args.key_hex.as_deref(), &args.data_dir)?);
    tracing::info!(
        vk = %wallet.verifying_key(),
        router = settings.network.socket_ports.router,
        publisher = settings.network.socket_ports.publisher,
        data_dir = %args.data_dir.display(),
        "starting tessera-node"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = ChainDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    seed_genesis(&db, &settings)?;

    // --- Metrics server ---
    let node_metrics: SharedMetrics = Arc::new(NodeMetrics::new());
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("{}:{}", settings.network.bind_host(), settings.metrics_port());
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    // --- Network ---
    let credentials = Arc::new(CredentialsProvider::new(settings.network.accept_all));
    let network = Network::new(
        Arc::clone(&wallet),
        settings.network.clone(),
        credentials,
        Arc::new(db.blocks.clone()),
        Arc::new(db.state.clone()),
    );
    network.start().await.context("failed to start network")?;

    let ctx = NodeContext {
        network,
        db,
        settings,
        metrics: node_metrics,
    };

    // --- Lifecycle ---
    let lifecycle = Lifecycle::new();
    ctx.metrics.set_state(lifecycle.state());
    ctx.metrics.set_state(lifecycle.fire(NodeEvent::Started)?);
    connect_bootnodes(&ctx).await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                NodeEvent::ShutdownRequested
            }
            event = step(lifecycle.state(), &ctx) => event,
        };
        let state = lifecycle.fire(event)?;
        ctx.metrics.set_state(state);
        if state == NodeState::ShuttingDown {
            break;
        }
    }

    ctx.network.stop().await;
    if let Err(e) = ctx.db.flush() {
        tracing::error!(error = %e, "database flush failed");
    }
    metrics_server.abort();
    ctx.metrics.set_state(lifecycle.fire(NodeEvent::Halted)?);
    tracing::info!("tessera-node stopped");
    Ok(())
}

/// Work for the current state. Resolves with the event that ends it.
async fn step(state: NodeState, ctx: &NodeContext) -> NodeEvent {
    match state {
        NodeState::Connecting => wait_for_peers(ctx).await,
        NodeState::CatchingUp => catch_up(ctx).await,
        NodeState::Running => run_until_behind(ctx).await,
        NodeState::Booting | NodeState::ShuttingDown | NodeState::Stopped => {
            std::future::pending().await
        }
    }
}

async fn wait_for_peers(ctx: &NodeContext) -> NodeEvent {
    if ctx.settings.bootnodes.is_empty() {
        tracing::info!("no bootnodes configured");
        return NodeEvent::NoPeers;
    }

    let deadline = tokio::time::Instant::now() + CONNECT_GRACE;
    while tokio::time::Instant::now() < deadline {
        if ctx.network.num_of_peers_connected() > 0 {
            return NodeEvent::PeersConnected;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    tracing::warn!(
        bootnodes = ctx.settings.bootnodes.len(),
        "no bootnode answered, running alone"
    );
    NodeEvent::NoPeers
}

async fn catch_up(ctx: &NodeContext) -> NodeEvent {
    let mut handler = CatchupHandler::new(
        Arc::clone(&ctx.network) as Arc<dyn CatchupNetwork>,
        Arc::new(ctx.db.blocks.clone()),
        Arc::new(ctx.db.state.clone()),
        Arc::new(ctx.db.nonces.clone()),
        ctx.settings.network.request_timeout(),
    );
    if let Some(allow) = &ctx.settings.network.catchup_allow_list {
        handler = handler.with_allow_list(allow.iter().cloned());
    }

    match handler.run().await {
        Ok(outcome) => {
            tracing::info!(?outcome, "catchup finished");
            ctx.metrics.record_catchup(Ok(&outcome));
            refresh_gauges(ctx);
            NodeEvent::CatchupFinished
        }
        Err(e) => {
            tracing::error!(error = %e, "catchup failed");
            ctx.metrics.record_catchup(Err(()));
            tokio::time::sleep(CATCHUP_RETRY_DELAY).await;
            NodeEvent::CatchupFailed
        }
    }
}

/// Keep the gauges fresh and watch for peers pulling ahead of us.
async fn run_until_behind(ctx: &NodeContext) -> NodeEvent {
    let mut ticker = tokio::time::interval(ctx.settings.network.ping_interval());
    ticker.tick().await;
    loop {
        ticker.tick().await;
        refresh_gauges(ctx);

        let local = ctx.db.blocks.get_latest_block_number().unwrap_or_default();
        for peer in ctx.network.get_gossip_group() {
            if let Some(info) = peer.get_latest_block_info().await {
                if info.number > local {
                    tracing::info!(
                        peer = %peer.server_vk(),
                        local,
                        remote = info.number,
                        "fell behind, catching up"
                    );
                    return NodeEvent::PeersConnected;
                }
            }
        }
    }
}

fn refresh_gauges(ctx: &NodeContext) {
    ctx.metrics
        .connected_peers
        .set(ctx.network.num_of_peers_connected() as i64);
    ctx.metrics.known_peers.set(ctx.network.peer_count() as i64);
    match ctx.db.blocks.get_latest_block_number() {
        Ok(height) => ctx.metrics.block_height.set(height as i64),
        Err(e) => tracing::warn!(error = %e, "cannot read chain height"),
    }
}

async fn connect_bootnodes(ctx: &NodeContext) {
    for node in &ctx.settings.bootnodes {
        match ctx.network.connect_peer(&node.ip, &node.vk).await {
            Ok(_) => tracing::info!(vk = %node.vk, ip = %node.ip, "dialing bootnode"),
            Err(e) => tracing::warn!(vk = %node.vk, ip = %node.ip, error = %e, "bootnode refused"),
        }
    }
}

/// Explicit path, then `<data_dir>/config.toml`, then defaults.
fn load_settings(explicit: Option<&Path>, data_dir: &Path) -> Result<NodeSettings> {
    if let Some(path) = explicit {
        return NodeSettings::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() {
        return NodeSettings::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    tracing::info!("no config file, using defaults");
    Ok(NodeSettings::default())
}

fn load_wallet(key_hex: Option<&str>, data_dir: &Path) -> Result<Wallet> {
    if let Some(hex) = key_hex {
        return Wallet::from_hex(hex.trim()).context("invalid node key");
    }
    let key_path = data_dir.join(KEY_FILE);
    let hex = std::fs::read_to_string(&key_path).with_context(|| {
        format!(
            "no node key at {} (run `tessera-node init` or pass --key-hex)",
            key_path.display()
        )
    })?;
    Wallet::from_hex(hex.trim())
        .with_context(|| format!("invalid node key in {}", key_path.display()))
}

/// Write block 0 and its committee state into an empty database.
fn seed_genesis(db: &ChainDb, settings: &NodeSettings) -> Result<()> {
    if db.blocks.get_latest_block()?.is_some() {
        return Ok(());
    }

    let state = settings.genesis.state_changes();
    let genesis = Block::genesis(settings.genesis.hlc_timestamp.clone(), state.clone());
    db.blocks.store_block(&genesis)?;
    for change in &state {
        db.state.safe_set(&change.key, &change.value, 0)?;
    }
    tracing::info!(
        hash = %genesis.hash,
        masternodes = settings.genesis.masternodes.len(),
        delegates = settings.genesis.delegates.len(),
        "genesis block written"
    );
    Ok(())
}

/// Initializes a new node data directory with a key and a starter config.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("tessera_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            key_path.display()
        );
    }

    let wallet = Wallet::generate();
    std::fs::write(&key_path, wallet.secret_key_hex())
        .with_context(|| format!("failed to write node key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let mut template = NodeSettings::default();
        template.network.socket_ports = SocketPorts::from_base(args.router_port);
        template.genesis.masternodes.push(wallet.verifying_key());
        std::fs::write(&config_path, template.to_toml()?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    tracing::info!(
        vk = %wallet.verifying_key(),
        key_path = %key_path.display(),
        "node key generated"
    );

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Node key       : {}", key_path.display());
    println!("  Config         : {}", config_path.display());
    println!("  Verifying key  : {}", wallet.verifying_key());

    Ok(())
}

fn print_version() {
    println!("tessera-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", PROTOCOL_VERSION);
    println!("rustc        {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
