//! Heartbeat Manager
//!
//! Detects half-open WebSocket connections through periodic ping/pong.
//! Used for the upstream feed (to trigger a reconnect) and for every
//! downstream session (to close and clean up silent clients).
//!
//! The manager never touches the socket. It emits [`HeartbeatEvent`]s and
//! the connection owner sends the actual ping frame, recording it with
//! [`HeartbeatState::mark_ping_sent`] and answering pongs with
//! [`HeartbeatState::record_pong`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// How long an unanswered ping may stay outstanding.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Ping every `interval`; a ping still unanswered at the following
    /// tick times out.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self::new(interval, interval / 2)
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request to send a ping message.
    SendPing,
    /// The outstanding ping was not answered in time.
    Timeout,
}

/// State shared between heartbeat manager and WebSocket handlers.
#[derive(Debug)]
pub struct HeartbeatState {
    ping_sent_at: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ping_sent_at: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// Record that a pong was received.
    pub fn record_pong(&self) {
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// Mark that a ping went out.
    ///
    /// While a ping is already outstanding the original send time is kept,
    /// so repeated pings cannot extend the deadline.
    pub fn mark_ping_sent(&self) {
        if !self.waiting_for_pong.swap(true, Ordering::SeqCst) {
            *self.ping_sent_at.write() = Instant::now();
        }
    }

    /// Check if we're currently waiting for a pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the outstanding ping was sent.
    #[must_use]
    pub fn time_since_ping(&self) -> Duration {
        self.ping_sent_at.read().elapsed()
    }
}

/// Heartbeat manager that monitors connection health.
///
/// # Example
///
/// ```rust,no_run
/// use market_data_gateway::infrastructure::heartbeat::{
///     HeartbeatConfig, HeartbeatManager, HeartbeatState, HeartbeatEvent,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let config = HeartbeatConfig::default();
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(10);
///     let cancel = CancellationToken::new();
///
///     let manager = HeartbeatManager::new(config, state.clone(), event_tx, cancel.clone());
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => {
///                 // Send ping over WebSocket
///                 state.mark_ping_sent();
///             }
///             HeartbeatEvent::Timeout => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat monitoring loop.
    ///
    /// Runs until cancelled, the event receiver is dropped, or a timeout is
    /// detected. The first ping is requested one interval after start.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_ping().await {
                        break;
                    }
                }
            }
        }
    }

    /// Check heartbeat state and request a ping.
    ///
    /// Returns `false` when the loop should exit.
    async fn check_and_ping(&self) -> bool {
        if self.state.is_waiting_for_pong() {
            let elapsed = self.state.time_since_ping();
            if elapsed >= self.config.pong_timeout {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis(),
                    timeout_ms = self.config.pong_timeout.as_millis(),
                    "Heartbeat timeout detected"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return false;
            }
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Event channel closed, stopping heartbeat");
            return false;
        }

        true
    }
}
