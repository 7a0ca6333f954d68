//! Subscription Table
//!
//! Reference-counted many-to-many mapping between downstream subscribers
//! and upstream streams.
//!
//! # Design
//!
//! The table tracks:
//! - Which streams each subscriber holds (its shadow set)
//! - Which subscribers want each stream (the ref-count is the set size)
//!
//! Every mutation reports the streams whose ref-count crossed zero, so the
//! caller can issue exactly one upstream SUBSCRIBE per 0→1 transition and
//! exactly one UNSUBSCRIBE per 1→0 transition. A stream is active upstream
//! iff its subscriber set is non-empty; empty entries are removed eagerly.
//!
//! The table is not synchronised. The registry owns it behind the same
//! mutex as the threshold baselines so transition checks and the upstream
//! send happen atomically.

use std::collections::{HashMap, HashSet};

use super::streaming::{StreamId, SubscriberId};

// =============================================================================
// Subscription Changes
// =============================================================================

/// Upstream transitions produced by a table mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Streams whose ref-count went 0→1.
    pub subscribe: Vec<StreamId>,
    /// Streams whose ref-count went 1→0.
    pub unsubscribe: Vec<StreamId>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(streams: impl IntoIterator<Item = StreamId>) -> Self {
        Self {
            subscribe: streams.into_iter().collect(),
            unsubscribe: Vec::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(streams: impl IntoIterator<Item = StreamId>) -> Self {
        Self {
            subscribe: Vec::new(),
            unsubscribe: streams.into_iter().collect(),
        }
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Ref-counted subscription edges.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    /// Map from subscriber to the streams it holds.
    subscriber_streams: HashMap<SubscriberId, HashSet<StreamId>>,
    /// Map from stream to the subscribers holding it.
    stream_subscribers: HashMap<StreamId, HashSet<SubscriberId>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add streams for a subscriber.
    ///
    /// Streams the subscriber already holds are skipped without touching
    /// the ref-count. Returns streams that need upstream subscription, in
    /// request order.
    pub fn add(&mut self, subscriber: SubscriberId, streams: &[StreamId]) -> SubscriptionChanges {
        let held = self.subscriber_streams.entry(subscriber).or_default();
        let mut activated = Vec::new();

        for stream in streams {
            if !held.insert(stream.clone()) {
                continue;
            }

            let holders = self.stream_subscribers.entry(stream.clone()).or_default();
            holders.insert(subscriber);

            if holders.len() == 1 {
                activated.push(stream.clone());
            }
        }

        if held.is_empty() {
            self.subscriber_streams.remove(&subscriber);
        }

        SubscriptionChanges::subscribe_only(activated)
    }

    /// Remove streams for a subscriber.
    ///
    /// Streams the subscriber does not hold are ignored. Returns streams
    /// that need upstream unsubscription, in request order.
    pub fn remove(
        &mut self,
        subscriber: SubscriberId,
        streams: &[StreamId],
    ) -> SubscriptionChanges {
        let Some(held) = self.subscriber_streams.get_mut(&subscriber) else {
            return SubscriptionChanges::default();
        };

        let mut deactivated = Vec::new();
        for stream in streams {
            if !held.remove(stream) {
                continue;
            }
            if Self::release(&mut self.stream_subscribers, subscriber, stream) {
                deactivated.push(stream.clone());
            }
        }

        if held.is_empty() {
            self.subscriber_streams.remove(&subscriber);
        }

        SubscriptionChanges::unsubscribe_only(deactivated)
    }

    /// Remove every stream a subscriber holds.
    ///
    /// Returns streams that need upstream unsubscription, sorted.
    pub fn remove_subscriber(&mut self, subscriber: SubscriberId) -> SubscriptionChanges {
        let Some(held) = self.subscriber_streams.remove(&subscriber) else {
            return SubscriptionChanges::default();
        };

        let mut deactivated: Vec<StreamId> = held
            .into_iter()
            .filter(|stream| Self::release(&mut self.stream_subscribers, subscriber, stream))
            .collect();
        deactivated.sort_unstable();

        SubscriptionChanges::unsubscribe_only(deactivated)
    }

    /// Drop one edge. Returns `true` when the stream lost its last holder.
    fn release(
        stream_subscribers: &mut HashMap<StreamId, HashSet<SubscriberId>>,
        subscriber: SubscriberId,
        stream: &str,
    ) -> bool {
        let Some(holders) = stream_subscribers.get_mut(stream) else {
            return false;
        };
        holders.remove(&subscriber);
        if holders.is_empty() {
            stream_subscribers.remove(stream);
            return true;
        }
        false
    }

    /// Subscribers currently holding a stream.
    #[must_use]
    pub fn subscribers(&self, stream: &str) -> Vec<SubscriberId> {
        self.stream_subscribers
            .get(stream)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any subscriber holds the stream.
    #[must_use]
    pub fn is_active(&self, stream: &str) -> bool {
        self.stream_subscribers.contains_key(stream)
    }

    /// Ref-count of a stream.
    #[must_use]
    pub fn ref_count(&self, stream: &str) -> usize {
        self.stream_subscribers.get(stream).map_or(0, HashSet::len)
    }

    /// Whether the subscriber holds the stream.
    #[must_use]
    pub fn holds(&self, subscriber: SubscriberId, stream: &str) -> bool {
        self.subscriber_streams
            .get(&subscriber)
            .is_some_and(|s| s.contains(stream))
    }

    /// All streams with a non-zero ref-count, sorted.
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<_> = self.stream_subscribers.keys().cloned().collect();
        streams.sort_unstable();
        streams
    }

    /// Streams held by one subscriber, sorted.
    #[must_use]
    pub fn subscriber_streams(&self, subscriber: SubscriberId) -> Vec<StreamId> {
        let mut streams: Vec<_> = self
            .subscriber_streams
            .get(&subscriber)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        streams.sort_unstable();
        streams
    }

    /// Table statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            stream_count: self.stream_subscribers.len(),
            subscriber_count: self.subscriber_streams.len(),
            edge_count: self.stream_subscribers.values().map(HashSet::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of streams active upstream.
    pub stream_count: usize,
    /// Number of subscribers holding at least one stream.
    pub subscriber_count: usize,
    /// Total subscriber/stream edges.
    pub edge_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
