use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;
use ems_api::create_app;
use ems_core::StationConfig;
use ems_engine::{PersistenceSink, spawn_coordinator};
use ems_fabric::{FabricAdapter, FabricConfig, OUTBOUND_BUFFER};
use ems_store::SqliteStore;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Command line arguments for the volta-ems server
#[derive(Parser, Debug)]
#[command(name = "volta-ems")]
#[command(about = "Site energy management system for EV charging")]
struct Args {
    /// Path to the station topology JSON file
    #[arg(short, long)]
    config: PathBuf,

    /// Port to bind the HTTP API to
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    broker_port: u16,

    /// SQLite database URL
    #[arg(long, default_value = "sqlite://volta-ems.db")]
    database_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // the topology is read once and immutable from here on
    let config_content = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("failed to read config file '{}'", args.config.display()))?;
    let station_config: StationConfig = serde_json::from_str(&config_content)
        .with_context(|| format!("failed to parse config file '{}'", args.config.display()))?;
    station_config
        .validate()
        .map_err(|error| anyhow::anyhow!("invalid station config: {error}"))?;
    tracing::info!(
        station_id = %station_config.station_id,
        "loaded station config from {}",
        args.config.display()
    );

    let store = SqliteStore::connect(&args.database_url)
        .await
        .context("failed to open the database")?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let fabric_connected = Arc::new(AtomicBool::new(false));
    let handle = spawn_coordinator(
        station_config.clone(),
        Arc::new(store) as Arc<dyn PersistenceSink>,
        outbound_tx,
        fabric_connected.clone(),
        64,
    );

    FabricAdapter::start(
        FabricConfig {
            broker_host: args.broker_host,
            broker_port: args.broker_port,
            site_id: station_config.station_id.clone(),
        },
        handle.clone(),
        outbound_rx,
        fabric_connected,
    );

    let app = create_app(handle);
    let bind_addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("starting server on {bind_addr}");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for the shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
