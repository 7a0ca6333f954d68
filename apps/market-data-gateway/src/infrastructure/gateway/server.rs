//! Gateway WebSocket Server
//!
//! Accepts downstream WebSocket connections at `GET /ws` and runs one
//! [`ClientSession`] per connection. The optional `compression` query
//! parameter (`none`, `gzip`, `deflate`) selects the session codec.
//!
//! Each connection runs two tasks: a writer draining the session's
//! notice and outbound queues into the socket, and the reader loop below, which also
//! drives the session heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::{RequestError, ServerFrame};
use super::session::{ClientSession, Outbound, OutboundQueues};
use crate::application::ports::Authenticator;
use crate::application::services::StreamRegistry;
use crate::infrastructure::codec::{Compression, MessageCodec, WireFrame};
use crate::infrastructure::config::SessionSettings;
use crate::infrastructure::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
};
use crate::infrastructure::metrics;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared state for all connections.
pub struct GatewayState {
    registry: Arc<StreamRegistry>,
    authenticator: Arc<dyn Authenticator>,
    settings: SessionSettings,
    cancel: CancellationToken,
}

impl GatewayState {
    /// Create gateway state.
    #[must_use]
    pub fn new(
        registry: Arc<StreamRegistry>,
        authenticator: Arc<dyn Authenticator>,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            authenticator,
            settings,
            cancel,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    compression: Option<String>,
}

/// Downstream WebSocket server.
pub struct GatewayServer {
    port: u16,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Create a new gateway server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<GatewayState>) -> Self {
        Self { port, state }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayServerError` if binding fails or the server stops
    /// with an error.
    pub async fn run(self) -> Result<(), GatewayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayServerError::BindFailed(self.port, e.to_string()))?;
        serve(listener, self.state).await
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve the gateway on an already bound listener until cancelled.
///
/// # Errors
///
/// Returns `GatewayServerError` if the server stops with an error.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> Result<(), GatewayServerError> {
    let cancel = state.cancel.clone();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Gateway listening");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayServerError::ServerFailed(e.to_string()))?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let compression = match params.compression.as_deref().unwrap_or_default().parse::<Compression>() {
        Ok(compression) => compression,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| run_connection(socket, state, compression))
}

// =============================================================================
// Connection
// =============================================================================

async fn run_connection(socket: WebSocket, state: Arc<GatewayState>, compression: Compression) {
    let codec = MessageCodec::new(compression);
    let (mut session, outbound, queues) = ClientSession::open(
        state.registry.clone(),
        state.authenticator.clone(),
        state.settings.max_streams,
        state.settings.buffer,
    );
    let subscriber_id = session.id();
    metrics::set_sessions(state.registry.stats().sessions);

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, queues, codec, subscriber_id));

    let cancel = state.cancel.child_token();
    let heartbeat = Arc::new(HeartbeatState::new());
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
    tokio::spawn(
        HeartbeatManager::new(
            HeartbeatConfig::every(state.settings.heartbeat_interval),
            heartbeat.clone(),
            heartbeat_tx,
            cancel.clone(),
        )
        .run(),
    );

    let _ = outbound
        .send(Outbound::Frame(ServerFrame::welcome(subscriber_id, compression)))
        .await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(event) = heartbeat_rx.recv() => match event {
                HeartbeatEvent::SendPing => {
                    heartbeat.mark_ping_sent();
                    if outbound.send(Outbound::Ping).await.is_err() {
                        break;
                    }
                }
                HeartbeatEvent::Timeout => {
                    tracing::info!(subscriber_id, "Client heartbeat timed out");
                    break;
                }
            },
            msg = stream.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match codec.decode_binary::<Value>(&bytes) {
                        Ok(value) => session.handle_value(value),
                        Err(e) => {
                            metrics::record_protocol_error(metrics::Side::Downstream);
                            RequestError::Undecodable(e.to_string()).into()
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        heartbeat.record_pong();
                        continue;
                    }
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id, error = %e, "Client socket error");
                        break;
                    }
                };
                if outbound.send(Outbound::Frame(reply)).await.is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    session.close();
    drop(session);
    drop(outbound);
    metrics::set_sessions(state.registry.stats().sessions);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queues: OutboundQueues,
    codec: MessageCodec,
    subscriber_id: u64,
) {
    loop {
        let item = tokio::select! {
            biased;
            Some(notice) = queues.notices.recv() => Outbound::Frame(notice),
            item = queues.frames.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let encoded = match &item {
            Outbound::Ping => Ok(Message::Ping(Vec::new().into())),
            Outbound::Data(frame) => codec.encode(frame.as_ref()).map(into_message),
            Outbound::Frame(frame) => codec.encode(frame).map(into_message),
        };

        let message = match encoded {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(subscriber_id, error = %e, "Failed to encode outbound frame");
                continue;
            }
        };

        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

fn into_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
