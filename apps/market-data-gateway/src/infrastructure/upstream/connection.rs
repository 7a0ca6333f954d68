//! Upstream Feed Connection
//!
//! Owns the single outbound WebSocket to the exchange and runs the
//! connection state machine:
//!
//! ```text
//! CLOSED ─open─► CONNECTING ─socket up─► OPEN ─error/close─► RECONNECT_WAIT
//!                    ▲                                            │
//!                    └───────────────── backoff elapsed ──────────┘
//!
//! RECONNECT_WAIT ─attempts exhausted─► FAILED ─open─► CONNECTING
//! any ─close─► CLOSING ─► CLOSED (terminal)
//! ```
//!
//! # Subscription Replay
//!
//! The connection mirrors every stream the registry has activated. On each
//! transition into OPEN the mirror is sent as one batched SUBSCRIBE, and any
//! commands still queued from before are discarded since the replay already
//! covers them. While not OPEN, new commands only update the mirror.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::messages::{UpstreamMessage, UpstreamRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedCommand, FeedControl};
use crate::domain::streaming::{StreamId, SubscriptionMethod};
use crate::infrastructure::codec::{CodecError, MessageCodec, WireFrame};
use crate::infrastructure::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
};
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one upstream connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No pong arrived for an outstanding ping.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// State & Events
// =============================================================================

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Idle, or terminally closed.
    Closed,
    /// Handshake in progress.
    Connecting,
    /// Connected; commands go straight to the wire.
    Open,
    /// Shutting down.
    Closing,
    /// Waiting out a backoff delay.
    ReconnectWait,
    /// Reconnect attempts exhausted; needs a manual `open()`.
    Failed,
}

impl ConnectionState {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::ReconnectWait => "RECONNECT_WAIT",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Reached OPEN and replayed active streams.
    Connected {
        /// Streams included in the replay SUBSCRIBE.
        replayed: usize,
    },
    /// A connection attempt ended.
    Disconnected {
        /// Why it ended.
        reason: String,
    },
    /// Waiting before the next attempt.
    Reconnecting {
        /// Consecutive attempt number (1-based).
        attempt: u32,
        /// Backoff delay.
        delay: Duration,
    },
    /// Market data for one stream.
    Tick {
        /// Stream the payload belongs to.
        stream: StreamId,
        /// Raw payload.
        data: Value,
    },
    /// Reconnect attempts exhausted.
    Failed {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// Terminally closed.
    Closed,
}

/// Snapshot of the connection for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive reconnect attempts since the last OPEN.
    pub attempt: u32,
    /// Data frames received over the process lifetime.
    pub messages_received: u64,
    /// Streams in the replay mirror.
    pub active_streams: usize,
    /// When the connection last reached OPEN.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last connection error.
    pub last_error: Option<String>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URL.
    pub url: String,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Bound on the CONNECTING state.
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::new(Duration::from_secs(20), Duration::from_secs(20)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Default)]
struct Lifecycle {
    running: bool,
    commands: Option<mpsc::UnboundedReceiver<FeedCommand>>,
    task: Option<JoinHandle<()>>,
}

/// The single upstream feed connection.
pub struct UpstreamFeedConnection {
    config: UpstreamConfig,
    codec: MessageCodec,
    event_tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    state: RwLock<ConnectionState>,
    mirror: Mutex<BTreeSet<StreamId>>,
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    lifecycle: Mutex<Lifecycle>,
    attempt: AtomicU32,
    messages_received: AtomicU64,
    next_request_id: AtomicU64,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    this: Weak<Self>,
}

impl std::fmt::Debug for UpstreamFeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamFeedConnection")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl UpstreamFeedConnection {
    /// Create a connection in the CLOSED state.
    ///
    /// Cancelling `cancel` has the same effect as [`Self::close`].
    #[must_use]
    pub fn new(
        config: UpstreamConfig,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            config,
            codec: MessageCodec::default(),
            event_tx,
            cancel,
            state: RwLock::new(ConnectionState::Closed),
            mirror: Mutex::new(BTreeSet::new()),
            command_tx,
            lifecycle: Mutex::new(Lifecycle {
                commands: Some(command_rx),
                ..Lifecycle::default()
            }),
            attempt: AtomicU32::new(0),
            messages_received: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
            this: this.clone(),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Streams that would be replayed on the next OPEN, sorted.
    #[must_use]
    pub fn mirrored_streams(&self) -> Vec<StreamId> {
        self.mirror.lock().iter().cloned().collect()
    }

    /// Health snapshot.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self.state(),
            attempt: self.attempt.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            active_streams: self.mirror.lock().len(),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Start the state machine from CLOSED or FAILED.
    ///
    /// No-op while already running and after [`Self::close`].
    pub fn open(&self) {
        if self.cancel.is_cancelled() {
            tracing::warn!("Upstream connection is closed; ignoring open");
            return;
        }

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("Upstream open called outside a Tokio runtime");
            return;
        };
        let (Some(this), Some(commands)) = (self.this.upgrade(), lifecycle.commands.take()) else {
            return;
        };

        lifecycle.running = true;
        self.set_state(ConnectionState::Connecting);
        lifecycle.task = Some(runtime.spawn(this.run(commands)));
    }

    /// Stop the connection for good, cancelling any pending reconnect.
    pub fn close(&self) {
        self.cancel.cancel();
        let lifecycle = self.lifecycle.lock();
        if !lifecycle.running && self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Closed);
        }
    }

    /// Close and wait for the connection task to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.close();
        let task = self.lifecycle.lock().task.take();
        if let Some(task) = task
            && tokio::time::timeout(timeout, task).await.is_err()
        {
            tracing::warn!("Upstream connection did not stop in time");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "Upstream state transition");
            metrics::set_upstream_state(next);
        }
    }

    async fn emit(&self, event: FeedEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Run the reconnect loop until closed or attempts are exhausted.
    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let result = self.connect_and_run(&mut commands, &mut policy).await;

            if self.cancel.is_cancelled() {
                break;
            }

            let reason = match result {
                Ok(()) => "connection closed".to_string(),
                Err(e) => e.to_string(),
            };
            tracing::warn!(error = %reason, "Upstream connection lost");
            *self.last_error.write() = Some(reason.clone());
            self.emit(FeedEvent::Disconnected { reason }).await;

            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(attempts, "Upstream reconnect attempts exhausted");
                {
                    let mut lifecycle = self.lifecycle.lock();
                    self.set_state(ConnectionState::Failed);
                    lifecycle.commands = Some(commands);
                    lifecycle.running = false;
                }
                self.emit(FeedEvent::Failed { attempts }).await;
                return;
            };

            let attempt = policy.attempt_count();
            self.attempt.store(attempt, Ordering::Relaxed);
            self.set_state(ConnectionState::ReconnectWait);
            metrics::record_upstream_reconnect();
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to upstream feed"
            );
            self.emit(FeedEvent::Reconnecting { attempt, delay }).await;

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            self.set_state(ConnectionState::Closed);
            lifecycle.running = false;
        }
        tracing::info!("Upstream connection closed");
        self.emit(FeedEvent::Closed).await;
    }

    /// Connect, replay, and pump messages until error or cancellation.
    async fn connect_and_run(
        &self,
        commands: &mut mpsc::UnboundedReceiver<FeedCommand>,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), UpstreamError> {
        tracing::info!(url = %self.config.url, "Connecting to upstream feed");

        let timeout = self.config.connect_timeout;
        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(timeout, connect) => {
                result.map_err(|_| UpstreamError::ConnectTimeout(timeout))??
            }
        };

        let (mut write, mut read) = ws_stream.split();

        policy.reset();
        self.attempt.store(0, Ordering::Relaxed);
        *self.last_connected_at.write() = Some(Utc::now());

        let replay = self.enter_open(commands);
        let replayed = replay.len();
        if !replay.is_empty() {
            tracing::info!(streams = replayed, "Replaying upstream subscriptions");
            self.write_request(&mut write, SubscriptionMethod::Subscribe, replay)
                .await?;
        }
        tracing::info!(replayed, "Upstream feed connected");
        self.emit(FeedEvent::Connected { replayed }).await;

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                heartbeat_state.clone(),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let result = self
            .pump(
                &mut write,
                &mut read,
                commands,
                &heartbeat_state,
                &mut heartbeat_rx,
            )
            .await;
        heartbeat_cancel.cancel();
        result
    }

    /// Transition to OPEN and take the replay set.
    ///
    /// Holding the mirror lock across the transition means every command is
    /// either in the snapshot or queued after it, never lost or doubled.
    fn enter_open(&self, commands: &mut mpsc::UnboundedReceiver<FeedCommand>) -> Vec<StreamId> {
        let mirror = self.mirror.lock();
        let mut discarded = 0usize;
        while commands.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded queued commands in favour of replay");
        }
        self.set_state(ConnectionState::Open);
        mirror.iter().cloned().collect()
    }

    async fn pump(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
        commands: &mut mpsc::UnboundedReceiver<FeedCommand>,
        heartbeat_state: &HeartbeatState,
        heartbeat_rx: &mut mpsc::Receiver<HeartbeatEvent>,
    ) -> Result<(), UpstreamError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(command) = commands.recv() => {
                    self.write_request(write, command.method, command.streams).await?;
                }
                Some(event) = heartbeat_rx.recv() => {
                    match event {
                        HeartbeatEvent::SendPing => {
                            heartbeat_state.mark_ping_sent();
                            write.send(Message::Ping(Vec::new().into())).await?;
                        }
                        HeartbeatEvent::Timeout => {
                            return Err(UpstreamError::HeartbeatTimeout);
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_pong();
                            self.handle_frame(self.codec.decode_text(text.as_str())).await;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            heartbeat_state.record_pong();
                            self.handle_frame(self.codec.decode_binary(&bytes)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat_state.record_pong();
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "Upstream sent close frame");
                            return Err(UpstreamError::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(UpstreamError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Route one decoded frame. Malformed frames are logged and dropped.
    async fn handle_frame(&self, decoded: Result<Value, CodecError>) {
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed upstream frame");
                metrics::record_protocol_error(metrics::Side::Upstream);
                return;
            }
        };

        match UpstreamMessage::classify(value) {
            Some(UpstreamMessage::Data { stream, data }) => {
                self.messages_received.fetch_add(1, Ordering::Relaxed);
                self.emit(FeedEvent::Tick { stream, data }).await;
            }
            Some(UpstreamMessage::Reply { id, error: None }) => {
                tracing::debug!(id, "Upstream request acknowledged");
            }
            Some(UpstreamMessage::Reply { id, error: Some(error) }) => {
                tracing::warn!(id, error = %error, "Upstream request rejected");
            }
            None => {
                tracing::warn!("Dropping unrecognised upstream frame");
                metrics::record_protocol_error(metrics::Side::Upstream);
            }
        }
    }

    async fn write_request(
        &self,
        write: &mut WsWrite,
        method: SubscriptionMethod,
        streams: Vec<StreamId>,
    ) -> Result<(), UpstreamError> {
        if streams.is_empty() {
            return Ok(());
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, method = method.as_str(), streams = ?streams, "Sending upstream request");

        let request = UpstreamRequest::new(method, streams, id);
        let message = match self.codec.encode(&request)? {
            WireFrame::Text(text) => Message::Text(text.into()),
            WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        write.send(message).await?;
        Ok(())
    }
}

impl FeedControl for UpstreamFeedConnection {
    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn open(&self) {
        Self::open(self);
    }

    fn send(&self, command: FeedCommand) {
        let mut mirror = self.mirror.lock();
        match command.method {
            SubscriptionMethod::Subscribe => {
                mirror.extend(command.streams.iter().cloned());
            }
            SubscriptionMethod::Unsubscribe => {
                for stream in &command.streams {
                    mirror.remove(stream);
                }
            }
        }

        // Outside OPEN the mirror alone is replayed on the next connect.
        if self.state() == ConnectionState::Open && self.command_tx.send(command).is_err() {
            tracing::debug!("Upstream command queue closed");
        }
    }
}
