//! Health Check and Operations Endpoint
//!
//! HTTP endpoint for health checks, upstream status reporting, Prometheus
//! metrics and runtime threshold tuning.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (upstream not failed)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /thresholds` - Current threshold gate configuration
//! - `PUT /thresholds` - Replace the threshold gate configuration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::StreamRegistry;
use crate::domain::threshold::ThresholdConfig;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::upstream::{ConnectionState, FeedStatus, UpstreamFeedConnection};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream connection status.
    pub upstream: FeedStatus,
    /// Session and subscription counts.
    pub sessions: SessionStatus,
    /// Active threshold configuration.
    pub thresholds: ThresholdConfig,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream open, or idle with nothing to serve.
    Healthy,
    /// Upstream reconnecting.
    Degraded,
    /// Upstream failed or shutting down.
    Unhealthy,
}

/// Session and subscription counts.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Connected downstream sessions.
    pub connected: usize,
    /// Streams active upstream.
    pub active_streams: usize,
    /// Subscriber/stream edges.
    pub subscriptions: usize,
    /// Streams holding a threshold baseline.
    pub baselines: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    registry: Arc<StreamRegistry>,
    upstream: Arc<UpstreamFeedConnection>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        registry: Arc<StreamRegistry>,
        upstream: Arc<UpstreamFeedConnection>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            registry,
            upstream,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health router.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/thresholds", get(get_thresholds).put(put_thresholds))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if is_ready(state.upstream.state()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn get_thresholds(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.registry.threshold_config())
}

async fn put_thresholds(
    State(state): State<Arc<HealthServerState>>,
    Json(config): Json<ThresholdConfig>,
) -> impl IntoResponse {
    match state.registry.set_threshold_config(config) {
        Ok(()) => (StatusCode::OK, Json(json!(config))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let upstream = state.upstream.status();
    let stats = state.registry.stats();

    HealthResponse {
        status: determine_health_status(upstream.state, stats.streams),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        sessions: SessionStatus {
            connected: stats.sessions,
            active_streams: stats.streams,
            subscriptions: stats.subscriptions,
            baselines: stats.baselines,
        },
        thresholds: state.registry.threshold_config(),
    }
}

const fn determine_health_status(state: ConnectionState, active_streams: usize) -> HealthStatus {
    match state {
        ConnectionState::Open => HealthStatus::Healthy,
        // The feed only opens once somebody subscribes.
        ConnectionState::Closed if active_streams == 0 => HealthStatus::Healthy,
        ConnectionState::Connecting | ConnectionState::ReconnectWait => HealthStatus::Degraded,
        ConnectionState::Closed | ConnectionState::Closing | ConnectionState::Failed => {
            HealthStatus::Unhealthy
        }
    }
}

const fn is_ready(state: ConnectionState) -> bool {
    !matches!(state, ConnectionState::Failed | ConnectionState::Closing)
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
