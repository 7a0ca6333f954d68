//! Port Interfaces
//!
//! Defines the interfaces (ports) between the registry and the adapters
//! around it, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedControl`: the single upstream feed connection
//! - `SessionSink`: one downstream client session's outbound queue
//! - `FanoutBackend`: optional cache/pub-sub for cross-instance fan-out
//!
//! ## Driver Ports (Inbound)
//!
//! - `Authenticator`: validates `AUTH` requests from clients

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::streaming::{StreamFrame, StreamId, SubscriptionMethod};

// =============================================================================
// Upstream Feed
// =============================================================================

/// A batched subscription change for the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCommand {
    /// SUBSCRIBE or UNSUBSCRIBE.
    pub method: SubscriptionMethod,
    /// Streams affected, in order.
    pub streams: Vec<StreamId>,
}

impl FeedCommand {
    /// Build a SUBSCRIBE command.
    #[must_use]
    pub const fn subscribe(streams: Vec<StreamId>) -> Self {
        Self {
            method: SubscriptionMethod::Subscribe,
            streams,
        }
    }

    /// Build an UNSUBSCRIBE command.
    #[must_use]
    pub const fn unsubscribe(streams: Vec<StreamId>) -> Self {
        Self {
            method: SubscriptionMethod::Unsubscribe,
            streams,
        }
    }
}

/// Control surface of the upstream feed connection.
///
/// All methods are synchronous and non-blocking so the registry can call
/// them while holding its lock.
#[cfg_attr(test, mockall::automock)]
pub trait FeedControl: Send + Sync {
    /// Whether the connection is currently OPEN.
    fn is_open(&self) -> bool;

    /// Start connecting if idle or failed. No-op otherwise.
    fn open(&self);

    /// Record a subscription change and queue it for the wire.
    fn send(&self, command: FeedCommand);
}

// =============================================================================
// Downstream Sessions
// =============================================================================

/// Outbound side of one downstream client session.
///
/// Implementations must not block. Returning `false` means the session
/// is not writable; callers skip it and leave cleanup to the session's own
/// close path.
pub trait SessionSink: Send + Sync {
    /// Queue a data frame for the client.
    fn deliver(&self, frame: Arc<StreamFrame>) -> bool;

    /// Queue an error frame for the client.
    fn notify_error(&self, message: &str) -> bool;
}

// =============================================================================
// Authentication
// =============================================================================

/// Authentication failures reported back to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The token was rejected.
    #[error("authentication rejected: {0}")]
    Rejected(String),
}

/// Validates credentials presented in an `AUTH` request.
pub trait Authenticator: Send + Sync {
    /// Check a client token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the token is not accepted.
    fn authenticate(&self, token: &str) -> Result<(), AuthError>;

    /// Whether sessions must authenticate before subscribing.
    fn required(&self) -> bool {
        false
    }
}

/// Accepts every token.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

// =============================================================================
// Cross-instance Fan-out
// =============================================================================

/// Failures of the fan-out backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    /// The backend could not be reached.
    #[error("fan-out backend unavailable: {0}")]
    Unavailable(String),
}

/// Cache and pub/sub collaborator used to mirror forwarded ticks.
///
/// The gateway runs unchanged when no backend is configured.
#[async_trait]
pub trait FanoutBackend: Send + Sync {
    /// Read a cached value.
    async fn get(&self, key: &str) -> Result<Option<String>, FanoutError>;

    /// Cache a value for `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), FanoutError>;

    /// Publish a message, returning the number of receivers reached.
    async fn publish(&self, channel: &str, message: String) -> Result<usize, FanoutError>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, FanoutError>;
}
