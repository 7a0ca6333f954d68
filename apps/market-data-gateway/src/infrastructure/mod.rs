//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstream exchange feed connection.
pub mod upstream;

/// Downstream WebSocket gateway and client sessions.
pub mod gateway;

/// JSON wire codec with optional compression.
pub mod codec;

/// Ping/pong liveness detection shared by both sides.
pub mod heartbeat;

/// In-process cache and pub/sub mirror.
pub mod fanout;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
