//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: connection state, reconnects, frames received
//! - **Fan-out**: frames forwarded, suppressed by the threshold gate, dropped
//! - **Sessions**: connected downstream clients, active streams
//! - **Errors**: protocol errors on either side
//! - **Latency**: dispatch duration per upstream frame
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::upstream::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream
    describe_gauge!(
        "gateway_upstream_state",
        "1 for the current upstream connection state, 0 otherwise"
    );
    describe_counter!(
        "gateway_upstream_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "gateway_upstream_messages_total",
        "Total data frames received from the upstream feed"
    );

    // Fan-out
    describe_counter!(
        "gateway_frames_forwarded_total",
        "Total frames delivered to downstream sessions"
    );
    describe_counter!(
        "gateway_frames_suppressed_total",
        "Total upstream frames held back by the threshold gate"
    );
    describe_counter!(
        "gateway_frames_dropped_total",
        "Total frames dropped because a session queue was full or closed"
    );

    // Sessions
    describe_gauge!(
        "gateway_sessions",
        "Number of connected downstream sessions"
    );
    describe_gauge!(
        "gateway_active_streams",
        "Number of streams with at least one subscriber"
    );

    // Errors
    describe_counter!(
        "gateway_protocol_errors_total",
        "Total malformed or rejected frames by side"
    );

    // Latency
    describe_histogram!(
        "gateway_dispatch_seconds",
        "Time to gate and fan out one upstream frame"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Which side of the gateway a protocol error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The upstream exchange feed.
    Upstream,
    /// A downstream client session.
    Downstream,
}

impl Side {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

const STATES: [ConnectionState; 6] = [
    ConnectionState::Closed,
    ConnectionState::Connecting,
    ConnectionState::Open,
    ConnectionState::Closing,
    ConnectionState::ReconnectWait,
    ConnectionState::Failed,
];

/// Set the upstream state gauge, one series per state.
pub fn set_upstream_state(current: ConnectionState) {
    for state in STATES {
        let value = if state == current { 1.0 } else { 0.0 };
        gauge!("gateway_upstream_state", "state" => state.as_str()).set(value);
    }
}

/// Record an upstream reconnection attempt.
pub fn record_upstream_reconnect() {
    counter!("gateway_upstream_reconnects_total").increment(1);
}

/// Record a data frame received from upstream.
pub fn record_upstream_message() {
    counter!("gateway_upstream_messages_total").increment(1);
}

/// Record frames delivered downstream.
pub fn record_frames_forwarded(count: u64) {
    counter!("gateway_frames_forwarded_total").increment(count);
}

/// Record a frame suppressed by the threshold gate.
pub fn record_frame_suppressed() {
    counter!("gateway_frames_suppressed_total").increment(1);
}

/// Record frames dropped for slow or closed sessions.
pub fn record_frames_dropped(count: u64) {
    counter!("gateway_frames_dropped_total").increment(count);
}

/// Update the downstream session count.
pub fn set_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_sessions").set(count as f64);
}

/// Update the active stream count.
pub fn set_active_streams(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_active_streams").set(count as f64);
}

/// Record a malformed or rejected frame.
pub fn record_protocol_error(side: Side) {
    counter!("gateway_protocol_errors_total", "side" => side.as_str()).increment(1);
}

/// Record how long one dispatch took.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!("gateway_dispatch_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_as_str() {
        assert_eq!(Side::Upstream.as_str(), "upstream");
        assert_eq!(Side::Downstream.as_str(), "downstream");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        set_upstream_state(ConnectionState::Open);
        record_frames_forwarded(3);
        record_protocol_error(Side::Downstream);
        record_dispatch_duration(Duration::from_micros(5));
    }

    #[test]
    fn every_state_has_a_series() {
        assert_eq!(STATES.len(), 6);
        assert!(STATES.contains(&ConnectionState::ReconnectWait));
    }
}
