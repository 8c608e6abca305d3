use std::sync::Arc;

use anyhow::{Context, Result};
use bonfire_relay::{config::Cli, serve, telemetry::Telemetry, RelayConfig, RelayState};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;

    info!(
        listen_addr = %config.listen_addr,
        max_frame_bytes = config.max_frame_bytes,
        connection_buffer = config.connection_buffer,
        "starting bonfire relay"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let grace = config.shutdown_grace;
    let state = Arc::new(RelayState::new(config, Some(telemetry.metrics_handle())));

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
