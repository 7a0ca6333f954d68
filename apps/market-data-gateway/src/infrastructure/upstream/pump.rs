//! Feed Event Pump
//!
//! The single task that drains [`FeedEvent`]s from the upstream connection
//! and routes ticks through the registry. Running dispatch on one task
//! keeps per-stream delivery order equal to upstream order.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use super::connection::FeedEvent;
use crate::application::services::{DispatchOutcome, StreamRegistry};
use crate::domain::streaming::StreamFrame;
use crate::infrastructure::fanout::TickMirror;
use crate::infrastructure::metrics;

/// Drain feed events until the channel closes or the feed is closed.
pub async fn pump_feed_events(
    mut events: mpsc::Receiver<FeedEvent>,
    registry: Arc<StreamRegistry>,
    mirror: Option<TickMirror>,
) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Tick { stream, data } => {
                metrics::record_upstream_message();
                let started = Instant::now();
                let mirrored = mirror
                    .as_ref()
                    .map(|_| StreamFrame::new(stream.clone(), data.clone()));

                match registry.dispatch(&stream, data) {
                    DispatchOutcome::Forwarded { delivered, skipped } => {
                        metrics::record_frames_forwarded(delivered as u64);
                        if skipped > 0 {
                            tracing::debug!(stream = %stream, skipped, "Skipped unwritable sessions");
                        }
                        if let (Some(mirror), Some(frame)) = (&mirror, mirrored) {
                            mirror.mirror(&frame).await;
                        }
                    }
                    DispatchOutcome::Suppressed => metrics::record_frame_suppressed(),
                    DispatchOutcome::NoSubscribers => {
                        tracing::trace!(stream = %stream, "Tick for inactive stream");
                    }
                }
                metrics::record_dispatch_duration(started.elapsed());
            }
            FeedEvent::Connected { replayed } => {
                tracing::info!(replayed, "Upstream feed open");
                metrics::set_active_streams(registry.stats().streams);
            }
            FeedEvent::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "Upstream feed disconnected");
            }
            FeedEvent::Reconnecting { attempt, delay } => {
                tracing::debug!(attempt, delay_ms = delay.as_millis(), "Upstream feed reconnecting");
            }
            FeedEvent::Failed { attempts } => {
                let message = format!("upstream feed unavailable after {attempts} reconnect attempts");
                let notified = registry.broadcast_error(&message);
                tracing::error!(attempts, notified, "Upstream feed failed");
            }
            FeedEvent::Closed => {
                tracing::info!("Upstream feed closed, stopping event pump");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::application::ports::{FeedCommand, FeedControl, SessionSink};
    use crate::domain::threshold::ThresholdConfig;
    use crate::infrastructure::fanout::InMemoryFanout;

    struct OpenFeed;

    impl FeedControl for OpenFeed {
        fn is_open(&self) -> bool {
            true
        }
        fn open(&self) {}
        fn send(&self, _command: FeedCommand) {}
    }

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<Arc<StreamFrame>>>,
        errors: Mutex<Vec<String>>,
    }

    impl SessionSink for Collect {
        fn deliver(&self, frame: Arc<StreamFrame>) -> bool {
            self.frames.lock().push(frame);
            true
        }
        fn notify_error(&self, message: &str) -> bool {
            self.errors.lock().push(message.to_string());
            true
        }
    }

    #[tokio::test]
    async fn ticks_are_gated_and_mirrored() {
        let registry = Arc::new(StreamRegistry::new(Arc::new(OpenFeed), ThresholdConfig::default()));
        let sink = Arc::new(Collect::default());
        let id = registry.register(sink.clone());
        registry.subscribe(id, &["btcusdt@ticker".to_string()]);

        let fanout = Arc::new(InMemoryFanout::default());
        let mirror = TickMirror::new(fanout, Duration::from_secs(60));

        let (tx, rx) = mpsc::channel(16);
        for price in ["100.00", "100.05", "100.11"] {
            tx.send(FeedEvent::Tick {
                stream: "btcusdt@ticker".into(),
                data: json!({"c": price}),
            })
            .await
            .unwrap();
        }
        tx.send(FeedEvent::Closed).await.unwrap();

        pump_feed_events(rx, registry, Some(mirror.clone())).await;

        let prices: Vec<_> = sink.frames.lock().iter().map(|f| f.data["c"].clone()).collect();
        assert_eq!(prices, vec![json!("100.00"), json!("100.11")]);
        assert_eq!(
            mirror.last("btcusdt@ticker").await.as_deref(),
            Some(r#"{"stream":"btcusdt@ticker","data":{"c":"100.11"}}"#)
        );
    }

    #[tokio::test]
    async fn failure_notifies_every_session() {
        let registry = Arc::new(StreamRegistry::new(Arc::new(OpenFeed), ThresholdConfig::default()));
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        registry.register(a.clone());
        registry.register(b.clone());

        let (tx, rx) = mpsc::channel(4);
        tx.send(FeedEvent::Failed { attempts: 3 }).await.unwrap();
        drop(tx);

        pump_feed_events(rx, registry, None).await;

        let expected = vec!["upstream feed unavailable after 3 reconnect attempts".to_string()];
        assert_eq!(*a.errors.lock(), expected);
        assert_eq!(*b.errors.lock(), expected);
    }
}
