//! Connection handlers for the relay server.
//!
//! This module drives the connection lifecycle: it upgrades incoming
//! requests, registers each socket with the broadcast registry, and feeds
//! the registry's transport callbacks from the per-connection read loop.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use relay_core::{BroadcastRegistry, ConnectionHandle, ConnectionId, MessageSink, TransportError};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast registry.
    pub registry: BroadcastRegistry,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            registry: BroadcastRegistry::with_capacity(config.limits.max_connections),
            config,
        }
    }
}

/// Outbound sink for one WebSocket connection.
///
/// Hands payloads to the connection's writer task; a closed channel means
/// the writer is gone and the connection can no longer accept writes.
struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSink for WsSink {
    fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.tx
            .send(Message::Text(payload.to_owned()))
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online": state.registry.count(),
        "capacity": state.registry.capacity(),
    }))
}

/// WebSocket upgrade handler.
///
/// A full registry refuses the upgrade outright. The authoritative check is
/// the `on_connect` after the handshake; this one just saves the handshake
/// when the outcome is already known.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.registry.is_full() {
        metrics::record_capacity_rejection();
        warn!(
            online = state.registry.count(),
            capacity = state.registry.capacity(),
            "Refusing upgrade: registry full"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
        .into_response()
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = ConnectionId::generate();

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the socket; the writer task is the only owner of the sink, so a
    // slow client stalls its own queue and nobody else's.
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Register with the hub; a rejected join never becomes a member and the
    // client is told to retry later.
    let handle = ConnectionHandle::new(connection_id.clone(), Arc::new(WsSink { tx: tx.clone() }));
    if let Err(e) = state.registry.on_connect(handle) {
        warn!(connection = %connection_id, error = %e, "Connection refused");
        metrics::record_capacity_rejection();
        let _ = tx.send(Message::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: "server at capacity".into(),
        })));
        drop(tx);
        let _ = writer.await;
        return;
    }

    let _metrics_guard = ConnectionMetricsGuard::new();

    // Read loop: every inbound text frame is relayed to all members.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                metrics::record_message(text.len(), "inbound");
                let report = state.registry.on_message(&text, &connection_id);
                metrics::record_broadcast(report.delivered, report.failed.len());

                // Members whose sink is gone get evicted here; their own
                // close callback may never fire.
                for id in &report.failed {
                    state.registry.leave(id);
                }
            }
            Ok(Message::Binary(_)) => {
                debug!(connection = %connection_id, "Ignoring binary frame");
            }
            Ok(Message::Ping(data)) => {
                if tx.send(Message::Pong(data)).is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                // Ignore pongs
            }
            Ok(Message::Close(_)) => {
                debug!(connection = %connection_id, "Received close frame");
                break;
            }
            Err(e) => {
                metrics::record_error("websocket");
                state.registry.on_transport_error(
                    &connection_id,
                    &TransportError::ReceiveFailed(e.to_string()),
                );
                break;
            }
        }
    }

    state.registry.on_close(&connection_id);
    drop(tx);
    let _ = writer.await;

    debug!(connection = %connection_id, "WebSocket disconnected");
}
