//! zpwoot: multi-tenant WhatsApp gateway.
//!
//! Entry point: loads configuration, opens storage, wires the event pipeline
//! to its consumers (webhook dispatcher, Chatwoot bridge), and serves the
//! HTTP API until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use zpwoot::chatwoot::{ChatwootBridge, OutboundHandler};
use zpwoot::client::BridgeClientFactory;
use zpwoot::config::Config;
use zpwoot::events::{EventPipeline, EventPublisher};
use zpwoot::logging::init_logging;
use zpwoot::media::MediaCache;
use zpwoot::messages::MessageService;
use zpwoot::runtime::SessionSupervisor;
use zpwoot::server::{serve, AppState};
use zpwoot::store::Store;
use zpwoot::webhooks::WebhookDispatcher;

#[derive(Parser)]
#[command(name = "zpwoot")]
#[command(about = "Multi-tenant WhatsApp gateway", long_about = None)]
struct Cli {
    /// Path to the config file (default: ~/.zpwoot/config.json)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    match cli.command {
        Some(Commands::Version) => {
            println!("zpwoot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Serve) | None => run_server(config).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    init_logging(&config.logging);
    config.validate().context("invalid configuration")?;

    info!("zpwoot {} starting", env!("CARGO_PKG_VERSION"));

    let store = Store::open(&config.db_path()).context("failed to open storage")?;
    let media = MediaCache::new(store.clone(), config.media_dir(), config.media.ttl_secs)
        .context("failed to open media cache")?;

    // Event pipeline and its two consumers. Either sink can be absent without
    // affecting the other; both register here.
    let publisher = Arc::new(EventPublisher::new());
    let dispatcher = WebhookDispatcher::start(store.clone(), &config.webhooks);
    publisher.register(dispatcher.clone()).await;
    let bridge = ChatwootBridge::new(store.clone());
    publisher.register(bridge).await;
    let pipeline = Arc::new(EventPipeline::new(publisher));

    // Session runtimes over the external protocol bridge.
    let factory = Arc::new(BridgeClientFactory::new(&config.bridge.base_url));
    let supervisor = SessionSupervisor::new(store.clone(), factory, pipeline);

    let messages = MessageService::new(Arc::clone(&supervisor), Arc::clone(&media));
    let outbound = Arc::new(OutboundHandler::new(store.clone(), messages.clone()));

    // Background expiry sweep for cached media.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = media.spawn_sweeper(
        std::time::Duration::from_secs(config.media.sweep_interval_secs),
        shutdown_rx.clone(),
    );

    // Mapping rows stuck in `pending` (process died mid-sync) become `failed`
    // after an hour; they are never re-sent.
    let pending_sweeper = {
        let store = store.clone();
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_secs(15 * 60)) => {
                        match store.sweep_stale_pending(chrono::Duration::hours(1)) {
                            Ok(0) => {}
                            Ok(n) => info!("marked {} stalled chatwoot mappings as failed", n),
                            Err(e) => warn!("pending mapping sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    };

    let state = AppState {
        store,
        supervisor: Arc::clone(&supervisor),
        messages,
        dispatcher: dispatcher.clone(),
        outbound,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
        }
        info!("shutdown signal received");
    };

    serve(state, addr, shutdown).await?;

    // Orderly teardown: stop accepting, stop runtimes, drain workers.
    supervisor.shutdown_all().await;
    dispatcher.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    let _ = pending_sweeper.await;

    info!("zpwoot stopped");
    Ok(())
}
