//! In-process Fan-out Backend
//!
//! An in-memory implementation of [`FanoutBackend`]: a TTL'd key/value
//! cache plus named `tokio::sync::broadcast` channels. Forwarded ticks are
//! mirrored into it by [`TickMirror`] so other in-process consumers can read
//! the last value per stream or follow a stream's channel.
//!
//! # Keys
//!
//! | Kind    | Name               | Content                         |
//! |---------|--------------------|---------------------------------|
//! | cache   | `tick:<stream>`    | last forwarded frame (JSON)     |
//! | channel | `ticks:<stream>`   | every forwarded frame (JSON)    |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FanoutBackend, FanoutError};
use crate::domain::streaming::StreamFrame;

/// Default per-channel buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Cache key of a stream's last forwarded frame.
#[must_use]
pub fn cache_key(stream: &str) -> String {
    format!("tick:{stream}")
}

/// Channel name carrying a stream's forwarded frames.
#[must_use]
pub fn channel_name(stream: &str) -> String {
    format!("ticks:{stream}")
}

/// In-memory cache and pub/sub.
#[derive(Debug)]
pub struct InMemoryFanout {
    cache: Mutex<HashMap<String, (String, Instant)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for InMemoryFanout {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryFanout {
    /// Create a backend with the given per-channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Drop expired cache entries and channels nobody listens to.
    ///
    /// Returns the number of cache entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, (_, expires_at)| *expires_at > now);
        self.channels
            .lock()
            .retain(|_, sender| sender.receiver_count() > 0);
        before - cache.len()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` until
    /// cancelled.
    pub fn spawn_purge(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Purged expired fan-out entries");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl FanoutBackend for InMemoryFanout {
    async fn get(&self, key: &str) -> Result<Option<String>, FanoutError> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), FanoutError> {
        self.cache
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize, FanoutError> {
        let channels = self.channels.lock();
        Ok(channels
            .get(channel)
            .map_or(0, |sender| sender.send(message).unwrap_or(0)))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, FanoutError> {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }
}

/// Mirrors forwarded frames into a [`FanoutBackend`].
///
/// Backend failures are logged and never affect delivery to sessions.
#[derive(Clone)]
pub struct TickMirror {
    backend: Arc<dyn FanoutBackend>,
    ttl: Duration,
}

impl std::fmt::Debug for TickMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickMirror")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TickMirror {
    /// Create a mirror writing into `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn FanoutBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Cache and publish one forwarded frame.
    pub async fn mirror(&self, frame: &StreamFrame) {
        let payload = match serde_json::to_string(frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(stream = %frame.stream, error = %e, "Failed to serialize mirrored frame");
                return;
            }
        };

        if let Err(e) = self
            .backend
            .set(&cache_key(&frame.stream), payload.clone(), self.ttl)
            .await
        {
            tracing::warn!(stream = %frame.stream, error = %e, "Fan-out cache write failed");
        }

        if let Err(e) = self.backend.publish(&channel_name(&frame.stream), payload).await {
            tracing::warn!(stream = %frame.stream, error = %e, "Fan-out publish failed");
        }
    }

    /// Last mirrored frame of a stream, if still cached.
    pub async fn last(&self, stream: &str) -> Option<String> {
        self.backend.get(&cache_key(stream)).await.ok().flatten()
    }
}
