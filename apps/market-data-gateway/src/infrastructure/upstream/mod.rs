//! Upstream Feed
//!
//! The single outbound WebSocket to the exchange: connection state
//! machine, wire messages, reconnect backoff and the event pump that
//! feeds the registry.

pub mod connection;
pub mod messages;
pub mod pump;
pub mod reconnect;

pub use connection::{
    ConnectionState, FeedEvent, FeedStatus, UpstreamConfig, UpstreamError, UpstreamFeedConnection,
};
pub use messages::{UpstreamMessage, UpstreamRequest};
pub use pump::pump_feed_events;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
