//! Websocket relay for bonfire rooms.
//!
//! The relay assigns each connection a peer id, tracks which room it joined,
//! and forwards `offer`/`answer`/`candidate` envelopes to the other members.
//! It never reads payloads and holds no keys.

pub mod config;
pub mod connection;
pub mod rooms;
pub mod telemetry;
pub mod websocket;

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

pub use config::RelayConfig;
pub use websocket::{router, RelayState};

/// Serves the relay on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!("bonfire-relay listening on {local_addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}
