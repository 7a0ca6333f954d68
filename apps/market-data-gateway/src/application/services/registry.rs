//! Stream Subscription Registry
//!
//! Process-scoped owner of the subscription edges, the session sinks and
//! the threshold baselines. All three live behind one mutex so that the
//! ref-count transition check and the upstream send are a single atomic
//! step: concurrent subscribe, unsubscribe and dispatch on the same stream
//! are linearizable.
//!
//! # Upstream Interaction
//!
//! ```text
//! subscribe   ─► open() if needed ─► table.add ─► 0→1 streams ─► SUBSCRIBE [..]
//! unsubscribe ─► table.remove  ─► 1→0 streams ─► UNSUBSCRIBE [..], forget baselines
//! dispatch    ─► gate          ─► forward     ─► every live session sink
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::application::ports::{FeedCommand, FeedControl, SessionSink};
use crate::domain::streaming::{StreamFrame, StreamId, SubscriberId, TickValue};
use crate::domain::subscription::{SubscriptionChanges, SubscriptionTable};
use crate::domain::threshold::{ThresholdConfig, ThresholdConfigError, ThresholdGate};

// =============================================================================
// Types
// =============================================================================

/// Result of routing one upstream tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The tick passed the gate and was offered to every subscriber.
    Forwarded {
        /// Sessions that accepted the frame.
        delivered: usize,
        /// Sessions that were not writable.
        skipped: usize,
    },
    /// The gate judged the tick insignificant.
    Suppressed,
    /// Nobody holds the stream (late tick after unsubscribe).
    NoSubscribers,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Streams active upstream.
    pub streams: usize,
    /// Subscriber/stream edges.
    pub subscriptions: usize,
    /// Streams with a threshold baseline.
    pub baselines: usize,
}

struct RegistryInner {
    table: SubscriptionTable,
    sessions: HashMap<SubscriberId, Arc<dyn SessionSink>>,
    gate: ThresholdGate,
}

// =============================================================================
// Registry
// =============================================================================

/// Ref-counting registry between client sessions and the upstream feed.
pub struct StreamRegistry {
    inner: Mutex<RegistryInner>,
    feed: Arc<dyn FeedControl>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl StreamRegistry {
    /// Create a registry driving the given feed.
    #[must_use]
    pub fn new(feed: Arc<dyn FeedControl>, thresholds: ThresholdConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                table: SubscriptionTable::new(),
                sessions: HashMap::new(),
                gate: ThresholdGate::new(thresholds),
            }),
            feed,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a session sink and allocate its subscriber id.
    pub fn register(&self, sink: Arc<dyn SessionSink>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().sessions.insert(id, sink);
        tracing::debug!(subscriber_id = id, "Session registered");
        id
    }

    /// Subscribe a session to streams.
    ///
    /// Streams the session already holds are no-ops. Streams whose
    /// ref-count goes 0→1 are sent upstream as one batched SUBSCRIBE.
    /// Any non-empty request opens the feed first if it is not OPEN, so a
    /// feed that gave up is restarted even when every stream is already
    /// active. Returns the 0→1 streams.
    pub fn subscribe(&self, subscriber: SubscriberId, streams: &[StreamId]) -> Vec<StreamId> {
        let mut inner = self.inner.lock();
        let SubscriptionChanges { subscribe, .. } = inner.table.add(subscriber, streams);

        if !streams.is_empty() && !self.feed.is_open() {
            self.feed.open();
        }
        if !subscribe.is_empty() {
            tracing::info!(subscriber_id = subscriber, streams = ?subscribe, "Activating upstream streams");
            self.feed.send(FeedCommand::subscribe(subscribe.clone()));
        }
        subscribe
    }

    /// Unsubscribe a session from streams.
    ///
    /// Streams whose ref-count goes 1→0 are sent upstream as one batched
    /// UNSUBSCRIBE and their baselines dropped. Returns those streams.
    pub fn unsubscribe(&self, subscriber: SubscriberId, streams: &[StreamId]) -> Vec<StreamId> {
        let mut inner = self.inner.lock();
        let changes = inner.table.remove(subscriber, streams);
        self.release(&mut inner, subscriber, changes)
    }

    /// Remove a session and everything it held.
    ///
    /// Called exactly once from the session's close path.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) -> Vec<StreamId> {
        let mut inner = self.inner.lock();
        inner.sessions.remove(&subscriber);
        let changes = inner.table.remove_subscriber(subscriber);
        tracing::debug!(subscriber_id = subscriber, "Session removed");
        self.release(&mut inner, subscriber, changes)
    }

    fn release(
        &self,
        inner: &mut RegistryInner,
        subscriber: SubscriberId,
        changes: SubscriptionChanges,
    ) -> Vec<StreamId> {
        let SubscriptionChanges { unsubscribe, .. } = changes;
        if unsubscribe.is_empty() {
            return unsubscribe;
        }
        for stream in &unsubscribe {
            inner.gate.forget(stream);
        }
        tracing::info!(subscriber_id = subscriber, streams = ?unsubscribe, "Releasing upstream streams");
        self.feed.send(FeedCommand::unsubscribe(unsubscribe.clone()));
        unsubscribe
    }

    /// Route an upstream tick to every session holding the stream.
    ///
    /// Payloads with a recognisable price pass through the threshold gate;
    /// others are always forwarded. Sessions that are not writable are
    /// skipped silently.
    pub fn dispatch(&self, stream: &str, data: Value) -> DispatchOutcome {
        let mut inner = self.inner.lock();
        let subscribers = inner.table.subscribers(stream);
        if subscribers.is_empty() {
            return DispatchOutcome::NoSubscribers;
        }

        if let Some(tick) = TickValue::from_payload(&data)
            && !inner.gate.should_forward(stream, &tick)
        {
            return DispatchOutcome::Suppressed;
        }

        let frame = Arc::new(StreamFrame::new(stream.to_string(), data));
        let mut delivered = 0;
        let mut skipped = 0;
        for id in subscribers {
            match inner.sessions.get(&id) {
                Some(sink) if sink.deliver(Arc::clone(&frame)) => delivered += 1,
                _ => skipped += 1,
            }
        }
        DispatchOutcome::Forwarded { delivered, skipped }
    }

    /// Send an error frame to every registered session.
    ///
    /// Returns the number of sessions notified.
    pub fn broadcast_error(&self, message: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .sessions
            .values()
            .filter(|sink| sink.notify_error(message))
            .count()
    }

    /// Streams currently active upstream, sorted.
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamId> {
        self.inner.lock().table.active_streams()
    }

    /// Streams held by one session, sorted.
    #[must_use]
    pub fn subscriber_streams(&self, subscriber: SubscriberId) -> Vec<StreamId> {
        self.inner.lock().table.subscriber_streams(subscriber)
    }

    /// Ref-count of a stream.
    #[must_use]
    pub fn ref_count(&self, stream: &str) -> usize {
        self.inner.lock().table.ref_count(stream)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        let table = inner.table.stats();
        RegistryStats {
            sessions: inner.sessions.len(),
            streams: table.stream_count,
            subscriptions: table.edge_count,
            baselines: inner.gate.len(),
        }
    }

    /// Current threshold settings.
    #[must_use]
    pub fn threshold_config(&self) -> ThresholdConfig {
        *self.inner.lock().gate.config()
    }

    /// Replace the threshold settings at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid; the old settings stay.
    pub fn set_threshold_config(&self, config: ThresholdConfig) -> Result<(), ThresholdConfigError> {
        config.validate()?;
        self.inner.lock().gate.set_config(config);
        tracing::info!(
            price_change_pct = %config.price_change_pct,
            volume_change_pct = %config.volume_change_pct,
            max_staleness_ms = config.max_staleness_ms,
            "Threshold config updated"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    use mockall::predicate::eq;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::application::ports::MockFeedControl;
    use crate::domain::streaming::SubscriptionMethod;

    fn ids(raw: &[&str]) -> Vec<StreamId> {
        raw.iter().map(ToString::to_string).collect()
    }

    /// Feed that records every command.
    #[derive(Default)]
    struct RecordingFeed {
        open: AtomicBool,
        opens: AtomicU64,
        commands: Mutex<Vec<FeedCommand>>,
    }

    impl RecordingFeed {
        fn opened() -> Arc<Self> {
            let feed = Self::default();
            feed.open.store(true, Ordering::SeqCst);
            Arc::new(feed)
        }

        fn commands(&self) -> Vec<FeedCommand> {
            self.commands.lock().clone()
        }
    }

    impl FeedControl for RecordingFeed {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn open(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn send(&self, command: FeedCommand) {
            self.commands.lock().push(command);
        }
    }

    /// Sink that records frames, optionally refusing them.
    #[derive(Default)]
    struct RecordingSink {
        closed: AtomicBool,
        frames: Mutex<Vec<Arc<StreamFrame>>>,
        errors: Mutex<Vec<String>>,
    }

    impl SessionSink for RecordingSink {
        fn deliver(&self, frame: Arc<StreamFrame>) -> bool {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().push(frame);
            true
        }

        fn notify_error(&self, message: &str) -> bool {
            self.errors.lock().push(message.to_string());
            true
        }
    }

    fn registry(feed: Arc<dyn FeedControl>) -> StreamRegistry {
        StreamRegistry::new(feed, ThresholdConfig::default())
    }

    #[test]
    fn first_subscribe_opens_and_sends_once() {
        let mut feed = MockFeedControl::new();
        feed.expect_is_open().times(2).return_const(false);
        feed.expect_open().times(2).return_const(());
        feed.expect_send()
            .with(eq(FeedCommand::subscribe(ids(&["btcusdt@ticker"]))))
            .times(1)
            .return_const(());

        let registry = registry(Arc::new(feed));
        let id = registry.register(Arc::new(RecordingSink::default()));

        assert_eq!(registry.subscribe(id, &ids(&["btcusdt@ticker"])), ids(&["btcusdt@ticker"]));
        // Idempotent: no second SUBSCRIBE goes upstream.
        assert!(registry.subscribe(id, &ids(&["btcusdt@ticker"])).is_empty());
        assert_eq!(registry.ref_count("btcusdt@ticker"), 1);
    }

    #[test]
    fn open_feed_is_not_reopened() {
        let mut feed = MockFeedControl::new();
        feed.expect_is_open().return_const(true);
        feed.expect_open().never();
        feed.expect_send().times(1).return_const(());

        let registry = registry(Arc::new(feed));
        let id = registry.register(Arc::new(RecordingSink::default()));
        registry.subscribe(id, &ids(&["a@trade"]));
    }

    #[test]
    fn subscribe_to_active_stream_restarts_down_feed() {
        let feed = Arc::new(RecordingFeed::default());
        let registry = registry(feed.clone());
        let x = registry.register(Arc::new(RecordingSink::default()));
        let y = registry.register(Arc::new(RecordingSink::default()));

        registry.subscribe(x, &ids(&["btcusdt@ticker"]));
        assert_eq!(feed.opens.load(Ordering::SeqCst), 1);

        // The feed never reported OPEN: y's subscribe restarts it without a new SUBSCRIBE
        assert!(registry.subscribe(y, &ids(&["btcusdt@ticker"])).is_empty());
        assert_eq!(feed.opens.load(Ordering::SeqCst), 2);
        assert_eq!(feed.commands(), vec![FeedCommand::subscribe(ids(&["btcusdt@ticker"]))]);

        assert!(registry.subscribe(y, &[]).is_empty());
        assert_eq!(feed.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn two_client_scenario() {
        let feed = RecordingFeed::opened();
        let registry = registry(feed.clone());
        let x = registry.register(Arc::new(RecordingSink::default()));
        let y = registry.register(Arc::new(RecordingSink::default()));

        registry.subscribe(x, &ids(&["btcusdt@ticker"]));
        registry.subscribe(y, &ids(&["btcusdt@ticker", "ethusdt@ticker"]));
        registry.remove_subscriber(x);
        registry.remove_subscriber(y);

        assert_eq!(
            feed.commands(),
            vec![
                FeedCommand::subscribe(ids(&["btcusdt@ticker"])),
                FeedCommand::subscribe(ids(&["ethusdt@ticker"])),
                FeedCommand::unsubscribe(ids(&["btcusdt@ticker", "ethusdt@ticker"])),
            ]
        );
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn unsubscribe_forgets_baseline() {
        let feed = RecordingFeed::opened();
        let registry = registry(feed);
        let id = registry.register(Arc::new(RecordingSink::default()));
        registry.subscribe(id, &ids(&["a@ticker"]));
        registry.dispatch("a@ticker", json!({"c": "100"}));
        assert_eq!(registry.stats().baselines, 1);

        assert_eq!(registry.unsubscribe(id, &ids(&["a@ticker"])), ids(&["a@ticker"]));
        assert_eq!(registry.stats().baselines, 0);
    }

    #[test]
    fn dispatch_gates_and_forwards() {
        let registry = registry(RecordingFeed::opened());
        let sink = Arc::new(RecordingSink::default());
        let id = registry.register(sink.clone());
        registry.subscribe(id, &ids(&["btcusdt@ticker"]));

        assert_eq!(
            registry.dispatch("btcusdt@ticker", json!({"c": "100.00"})),
            DispatchOutcome::Forwarded { delivered: 1, skipped: 0 }
        );
        assert_eq!(
            registry.dispatch("btcusdt@ticker", json!({"c": "100.05"})),
            DispatchOutcome::Suppressed
        );
        assert_eq!(
            registry.dispatch("btcusdt@ticker", json!({"c": "100.11"})),
            DispatchOutcome::Forwarded { delivered: 1, skipped: 0 }
        );

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data, json!({"c": "100.11"}));
        assert_eq!(frames[1].stream, "btcusdt@ticker");
    }

    #[test]
    fn dispatch_without_price_always_forwards() {
        let registry = registry(RecordingFeed::opened());
        let sink = Arc::new(RecordingSink::default());
        let id = registry.register(sink.clone());
        registry.subscribe(id, &ids(&["btcusdt@depth"]));

        for _ in 0..3 {
            registry.dispatch("btcusdt@depth", json!({"bids": [], "asks": []}));
        }
        assert_eq!(sink.frames.lock().len(), 3);
        assert_eq!(registry.stats().baselines, 0);
    }

    #[test]
    fn dispatch_survives_out_of_range_prices() {
        let registry = registry(RecordingFeed::opened());
        let sink = Arc::new(RecordingSink::default());
        let id = registry.register(sink.clone());
        registry.subscribe(id, &ids(&["btcusdt@bookTicker", "btcusdt@ticker"]));

        let max = "79228162514264337593543950335";
        for _ in 0..2 {
            assert_eq!(
                registry.dispatch("btcusdt@bookTicker", json!({"b": max, "a": max})),
                DispatchOutcome::Forwarded { delivered: 1, skipped: 0 }
            );
        }

        registry.dispatch("btcusdt@ticker", json!({"c": "0.0000000000000000000000000001"}));
        assert_eq!(
            registry.dispatch("btcusdt@ticker", json!({"c": "1000"})),
            DispatchOutcome::Forwarded { delivered: 1, skipped: 0 }
        );
        assert_eq!(sink.frames.lock().len(), 4);
    }

    #[test]
    fn dispatch_without_subscribers() {
        let registry = registry(RecordingFeed::opened());
        assert_eq!(
            registry.dispatch("ghost@ticker", json!({"c": "1"})),
            DispatchOutcome::NoSubscribers
        );
        assert_eq!(registry.stats().baselines, 0);
    }

    #[test]
    fn dispatch_skips_unwritable_sessions() {
        let registry = registry(RecordingFeed::opened());
        let live = Arc::new(RecordingSink::default());
        let dead = Arc::new(RecordingSink::default());
        dead.closed.store(true, Ordering::SeqCst);

        let a = registry.register(live.clone());
        let b = registry.register(dead);
        registry.subscribe(a, &ids(&["x@trade"]));
        registry.subscribe(b, &ids(&["x@trade"]));

        assert_eq!(
            registry.dispatch("x@trade", json!({"p": "1", "q": "1"})),
            DispatchOutcome::Forwarded { delivered: 1, skipped: 1 }
        );
        // The dead session still holds its subscription until it closes itself.
        assert_eq!(registry.ref_count("x@trade"), 2);
    }

    #[test]
    fn broadcast_error_reaches_every_session() {
        let registry = registry(RecordingFeed::opened());
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        registry.register(a.clone());
        registry.register(b.clone());

        assert_eq!(registry.broadcast_error("upstream failed"), 2);
        assert_eq!(*a.errors.lock(), vec!["upstream failed".to_string()]);
        assert_eq!(b.errors.lock().len(), 1);
    }

    #[test]
    fn threshold_config_roundtrip_and_validation() {
        let registry = registry(RecordingFeed::opened());
        let mut config = registry.threshold_config();
        config.max_staleness_ms = 250;
        registry.set_threshold_config(config).unwrap();
        assert_eq!(registry.threshold_config().max_staleness_ms, 250);

        config.price_change_pct = rust_decimal::Decimal::NEGATIVE_ONE;
        assert!(registry.set_threshold_config(config).is_err());
        assert_eq!(registry.threshold_config().max_staleness_ms, 250);
        assert!(registry.threshold_config().price_change_pct.is_sign_positive());
    }

    #[test]
    fn concurrent_subscribers_send_one_subscribe() {
        use std::thread;

        let feed = RecordingFeed::opened();
        let registry = Arc::new(registry(feed.clone()));
        let mut handles = vec![];

        for _ in 0..16 {
            let r = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let id = r.register(Arc::new(RecordingSink::default()));
                r.subscribe(id, &ids(&["shared@ticker"]));
                r.remove_subscriber(id);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let commands = feed.commands();
        let subs = commands
            .iter()
            .filter(|c| c.method == SubscriptionMethod::Subscribe)
            .count();
        let unsubs = commands.len() - subs;
        assert_eq!(subs, unsubs);
        assert!(subs >= 1);
        // Transitions strictly alternate.
        for pair in commands.windows(2) {
            assert_ne!(pair[0].method, pair[1].method);
        }
        assert_eq!(registry.ref_count("shared@ticker"), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize, usize),
        Unsubscribe(usize, usize),
        Disconnect(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, 0..3usize).prop_map(|(c, s)| Op::Subscribe(c, s)),
            (0..4usize, 0..3usize).prop_map(|(c, s)| Op::Unsubscribe(c, s)),
            (0..4usize).prop_map(Op::Disconnect),
        ]
    }

    proptest! {
        #[test]
        fn upstream_transitions_match_ref_counts(ops in proptest::collection::vec(op(), 1..64)) {
            const STREAMS: [&str; 3] = ["a@ticker", "b@ticker", "c@ticker"];

            let feed = RecordingFeed::opened();
            let registry = registry(feed.clone());
            let clients: Vec<SubscriberId> = (0..4)
                .map(|_| registry.register(Arc::new(RecordingSink::default())))
                .collect();

            for op in ops {
                match op {
                    Op::Subscribe(c, s) => {
                        registry.subscribe(clients[c], &ids(&[STREAMS[s]]));
                    }
                    Op::Unsubscribe(c, s) => {
                        registry.unsubscribe(clients[c], &ids(&[STREAMS[s]]));
                    }
                    Op::Disconnect(c) => {
                        registry.remove_subscriber(clients[c]);
                    }
                }
            }

            let mut upstream: HashSet<StreamId> = HashSet::new();
            for command in feed.commands() {
                for stream in command.streams {
                    match command.method {
                        // Exactly one SUBSCRIBE per activation.
                        SubscriptionMethod::Subscribe => prop_assert!(upstream.insert(stream)),
                        // Exactly one UNSUBSCRIBE per deactivation.
                        SubscriptionMethod::Unsubscribe => prop_assert!(upstream.remove(&stream)),
                    }
                }
            }

            let active: HashSet<StreamId> = registry.active_streams().into_iter().collect();
            prop_assert_eq!(upstream, active);
        }
    }
}
