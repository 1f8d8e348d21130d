//! Connection handlers for the Beam server.
//!
//! This module handles the connection lifecycle and frame processing: one
//! WebSocket per connection, one outbound queue per connection drained
//! here, and every decoded inbound frame handed to the hub as one atomic
//! unit of work.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beam_core::{ConnectionId, Hub};
use beam_protocol::{codec, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The coordination hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::new(config.hub_config()),
            config,
        }
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
            error!("Failed to start metrics server: {}", e);
        }
    }

    spawn_sweeper(state.clone());

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Beam server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Periodic garbage collection of ended sessions.
fn spawn_sweeper(state: Arc<AppState>) {
    let interval = state.config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.hub.sweep_stale();
            metrics::set_live_sessions(state.hub.stats().sessions.live);
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": {
            "live": stats.sessions.live,
            "total": stats.sessions.total,
        },
        "users": {
            "total": stats.users.total,
            "connected": stats.users.connected,
            "disconnected": stats.users.disconnected,
        },
    }))
}

/// Live session listing.
async fn sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": state.hub.live_sessions() }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.hub.connection_count() >= state.config.limits.max_connections {
        warn!("Connection rejected: at capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
        .into_response()
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let conn = ConnectionId::generate();
    debug!(connection = %conn, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Attach this connection's outbound queue to the hub.
    let (tx, mut outbound) = mpsc::unbounded_channel::<ServerFrame>();
    state.hub.connect(conn.clone(), tx);

    // Greet with the assigned connection id.
    let greeting = ServerFrame::Connected {
        connection_id: conn.to_string(),
        version: PROTOCOL_VERSION,
        heartbeat: state.config.heartbeat.interval_ms as u32,
    };
    if let Ok(data) = codec::encode(&greeting) {
        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
            error!(connection = %conn, "Failed to send greeting");
            state.hub.disconnect(&conn);
            return;
        }
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Frame processing loop
    loop {
        tokio::select! {
            biased;

            // Frames the hub queued for this connection
            Some(frame) = outbound.recv() => {
                match codec::encode(&frame) {
                    Ok(data) => {
                        metrics::record_frame(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %conn, error = %e, "Failed to encode outbound frame");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            warn!(connection = %conn, size = data.len(), "Message too large");
                            metrics::record_error("oversized");
                            send_error(&mut sender, 1002, "message too large").await;
                            continue;
                        }

                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        // Decode as many complete frames as the buffer holds
                        loop {
                            match codec::decode_from::<ClientFrame>(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    metrics::record_frame(data.len(), "inbound");
                                    state.hub.handle(&conn, frame);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %conn, error = %e, "Protocol error");
                                    metrics::record_error("protocol");
                                    read_buffer.clear();
                                    send_error(&mut sender, 1001, format!("malformed frame: {e}")).await;
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // The hub ends the session or leaves it on our behalf and marks the
    // identity disconnected.
    state.hub.disconnect(&conn);
    metrics::set_live_sessions(state.hub.stats().sessions.live);

    debug!(connection = %conn, "WebSocket disconnected");
}

/// Best-effort error frame straight to the socket, bypassing the queue.
async fn send_error(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    message: impl Into<String>,
) {
    if let Ok(data) = codec::encode(&ServerFrame::error(code, message)) {
        let _ = sender.send(Message::Binary(data.to_vec())).await;
    }
}
