#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Gateway - Real-time Fan-out
//!
//! A WebSocket gateway that keeps one upstream connection to an exchange's
//! combined-stream feed and fans ticks out to many downstream clients.
//! Upstream streams are ref-counted across clients, replayed after every
//! reconnect, and gated by a per-stream significance threshold before
//! being forwarded.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `streaming`: Stream ids, frames and tick values
//!   - `subscription`: Ref-counted subscription table
//!   - `threshold`: Significance gate and its settings
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed control, session sinks, authentication, fan-out
//!   - `services`: The stream registry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: Exchange WebSocket client and event pump
//!   - `gateway`: Downstream WebSocket server and client sessions
//!   - `codec`: JSON framing with optional compression
//!   - `heartbeat`: Ping/pong liveness tracking
//!   - `fanout`: Optional in-process tick mirror
//!   - `config`: Environment configuration
//!   - `health`: Health, readiness, thresholds and metrics HTTP endpoints
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐   ┌──────────┐   ┌─────────────┐
//! Exchange WS ──────►│   Upstream   │──►│ Registry │──►│   Session   │──► Client 1
//!             ◄──────│  Connection  │   │ + Gate   │   │   Queues    │──► Client 2
//!   SUBSCRIBE /      └──────────────┘   └──────────┘   └─────────────┘──► Client N
//!   UNSUBSCRIBE            ▲                  │
//!                          └──── 0→1 / 1→0 ───┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{StreamFrame, StreamId, StreamIdError, SubscriberId, TickValue};
pub use domain::threshold::{ThresholdConfig, ThresholdConfigError};

// Registry
pub use application::services::{DispatchOutcome, RegistryStats, StreamRegistry};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FanoutMode, FanoutSettings, GatewayConfig, ServerSettings, SessionSettings,
    UpstreamSettings,
};

// Servers
pub use infrastructure::gateway::{GatewayServer, GatewayServerError, GatewayState};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Upstream feed
pub use infrastructure::upstream::{
    ConnectionState, FeedEvent, UpstreamConfig, UpstreamFeedConnection, pump_feed_events,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
