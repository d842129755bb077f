//! tickrelay: downsampled market price relay
//!
//! Streams ticks from Binance, throttles them per symbol, batches the survivors and posts each
//! batch to the configured webhook targets.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickrelay_config::RelayConfig;
use tickrelay_lib::{
    run_server, shutdown::shutdown_signal, BinanceConnector, ConnectionManager, HttpDelivery,
    Pipeline, ServerState,
};

#[derive(Parser, Debug)]
#[command(name = "tickrelay")]
#[command(about = "Relay downsampled Binance ticks to webhook targets")]
struct Args {
    /// Path to relay configuration file
    #[arg(short, long, env = "TICKRELAY_CONFIG")]
    config: PathBuf,

    /// Health server bind address (overrides server.addr)
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig::load(&args.config)?;
    info!(
        symbols = config.feed.symbols.len(),
        stream = ?config.feed.stream,
        targets = config.delivery.targets.len(),
        window_ms = config.batch.window_ms,
        "Loaded relay configuration"
    );

    let addr: SocketAddr = args.addr.as_deref().unwrap_or(&config.server.addr).parse()?;

    let connector = BinanceConnector::from_config(&config.feed)?;
    info!(url = %connector.url(), "Feed endpoint");

    let delivery = Arc::new(HttpDelivery::from_config(&config.delivery)?);
    for target in &config.delivery.targets {
        if target.url.as_deref().map_or(true, str::is_empty) {
            info!(target = %target.name, "Target has no endpoint, deliveries disabled");
        }
    }
    let mut pipeline = Pipeline::from_config(&config, delivery);
    let drain_grace = config.delivery.timeout() + Duration::from_secs(1);

    let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::new(
        connector,
        config.feed.heartbeat_interval(),
        config.feed.reconnect_delay(),
        ticks_tx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down");
        shutdown_tx.send(true).ok();
    });

    let server_state = ServerState::new(config.feed.symbols.len(), manager.connected_handle());
    tokio::spawn(async move {
        if let Err(e) = run_server(addr, server_state).await {
            error!(error = %e, "Health server error");
        }
    });

    let feed_shutdown = shutdown_rx.clone();
    let feed = tokio::spawn(async move { manager.run(feed_shutdown).await });

    pipeline.run(ticks_rx, shutdown_rx).await;

    if let Err(e) = feed.await {
        error!(error = %e, "Feed task failed");
    }

    // Batches already flushed still get their POST
    pipeline.drain(drain_grace).await;

    info!("tickrelay stopped");
    Ok(())
}
