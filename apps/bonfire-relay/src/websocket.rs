use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{config::RelayConfig, connection::RelayConnection, rooms::RoomRegistry};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RelayState {
    pub config: RelayConfig,
    pub registry: RoomRegistry,
    metrics: Option<PrometheusHandle>,
    active_connections: AtomicUsize,
}

impl RelayState {
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            config,
            registry: RoomRegistry::new(),
            metrics,
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn on_connection_opened(&self) {
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("bonfire_relay_connections_total", 1);
        gauge!("bonfire_relay_connections_active", active as f64);
    }

    fn on_connection_closed(&self) {
        let active = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        gauge!("bonfire_relay_connections_active", active as f64);
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/rooms", get(rooms_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn rooms_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(json!({
        "active_connections": state.active_connections(),
        "rooms": state.registry.snapshot(),
    }))
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(State(state): State<Arc<RelayState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.connection_buffer);
    let mut connection =
        RelayConnection::new(state.registry.clone(), tx, state.config.max_frame_bytes);
    let peer_id = connection.peer_id().clone();
    state.on_connection_opened();
    info!(peer_id = %peer_id, "relay connection established");

    let writer_peer = peer_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        tracing::debug!(peer_id = %writer_peer, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => connection.handle_text(&text),
            Ok(Message::Binary(bytes)) => connection.handle_binary(bytes),
            Ok(Message::Close(frame)) => {
                info!(
                    peer_id = %peer_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(peer_id = %peer_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    if let Some(outcome) = connection.leave() {
        info!(
            peer_id = %peer_id,
            remaining = outcome.remaining,
            room_closed = outcome.room_closed,
            "peer removed from room"
        );
    }
    // Dropping the connection releases the last sender, which ends the writer.
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    state.on_connection_closed();
    info!(peer_id = %peer_id, "relay connection closed");
}
