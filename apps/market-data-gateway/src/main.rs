//! Market Data Gateway Binary
//!
//! Starts the market data fan-out gateway.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-gateway
//! ```
//!
//! # Environment Variables
//!
//! All variables are optional.
//!
//! - `UPSTREAM_WS_URL`: Upstream combined-stream endpoint
//!   (default: `wss://stream.binance.com:9443/stream`)
//! - `GATEWAY_PORT`: Downstream WebSocket port (default: 8080)
//! - `GATEWAY_HEALTH_PORT`: Health and metrics HTTP port (default: 8082)
//! - `GATEWAY_RECONNECT_BASE_DELAY_MS`: First reconnect delay (default: 50)
//! - `GATEWAY_RECONNECT_CAP_DELAY_MS`: Reconnect delay ceiling (default: 2000)
//! - `GATEWAY_MAX_RECONNECT_ATTEMPTS`: Give up after N failed attempts (default: unlimited)
//! - `GATEWAY_UPSTREAM_PING_INTERVAL_SECS`: Upstream ping interval (default: 20)
//! - `GATEWAY_UPSTREAM_PONG_TIMEOUT_SECS`: Upstream pong timeout (default: 20)
//! - `GATEWAY_CONNECT_TIMEOUT_MS`: Upstream connect timeout (default: 10000)
//! - `GATEWAY_HEARTBEAT_INTERVAL_MS`: Client ping interval (default: 30000)
//! - `GATEWAY_SESSION_BUFFER`: Per-client outbound queue (default: 1024)
//! - `GATEWAY_MAX_STREAMS_PER_SESSION`: Per-client stream limit (default: 200)
//! - `GATEWAY_PRICE_CHANGE_PCT`: Price threshold percent (default: 0.1)
//! - `GATEWAY_VOLUME_CHANGE_PCT`: Volume threshold percent (default: 1.0)
//! - `GATEWAY_MAX_STALENESS_MS`: Forward at least this often (default: 5000)
//! - `GATEWAY_FANOUT_MIRROR`: `disabled` | `memory` (default: disabled)
//! - `GATEWAY_FANOUT_TTL_SECS`: Mirrored tick TTL (default: 60)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-data-gateway)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_data_gateway::application::ports::AllowAll;
use market_data_gateway::infrastructure::fanout::{InMemoryFanout, TickMirror};
use market_data_gateway::infrastructure::gateway::{GatewayServer, GatewayState};
use market_data_gateway::infrastructure::health::{HealthServer, HealthServerState};
use market_data_gateway::infrastructure::telemetry;
use market_data_gateway::infrastructure::upstream::{UpstreamFeedConnection, pump_feed_events};
use market_data_gateway::{FanoutMode, GatewayConfig, StreamRegistry, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream event channel capacity.
const FEED_EVENT_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Data Gateway");

    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream feed: opened lazily by the first subscription
    let (feed_tx, feed_rx) = mpsc::channel(FEED_EVENT_BUFFER);
    let upstream = UpstreamFeedConnection::new(
        config.upstream_config(),
        feed_tx,
        shutdown_token.child_token(),
    );

    let registry = Arc::new(StreamRegistry::new(upstream.clone(), config.threshold));

    let mirror = match config.fanout.mode {
        FanoutMode::Memory => {
            let fanout = Arc::new(InMemoryFanout::default());
            Arc::clone(&fanout).spawn_purge(config.fanout.ttl, shutdown_token.child_token());
            Some(TickMirror::new(fanout, config.fanout.ttl))
        }
        FanoutMode::Disabled => None,
    };

    let pump_handle = tokio::spawn(pump_feed_events(feed_rx, Arc::clone(&registry), mirror));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&registry),
        Arc::clone(&upstream),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Downstream gateway
    let gateway_state = Arc::new(GatewayState::new(
        Arc::clone(&registry),
        Arc::new(AllowAll),
        config.session.clone(),
        shutdown_token.clone(),
    ));
    let gateway_server = GatewayServer::new(config.server.gateway_port, gateway_state);
    let gateway_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = gateway_server.run().await {
            tracing::error!(error = %e, "Gateway server error");
            gateway_token.cancel();
        }
    });

    tracing::info!(
        gateway_port = config.server.gateway_port,
        health_port = config.server.health_port,
        "Market Data Gateway ready"
    );

    await_shutdown(shutdown_token).await;

    upstream.shutdown(SHUTDOWN_TIMEOUT).await;
    // A feed that never opened emits no Closed event
    pump_handle.abort();

    tracing::info!("Market Data Gateway stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        upstream_url = %config.upstream.url,
        gateway_port = config.server.gateway_port,
        health_port = config.server.health_port,
        fanout = config.fanout.mode.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(
        reconnect_base_ms = config.upstream.reconnect_base_delay.as_millis(),
        reconnect_cap_ms = config.upstream.reconnect_cap_delay.as_millis(),
        max_reconnect_attempts = ?config.upstream.max_reconnect_attempts,
        heartbeat_interval_ms = config.session.heartbeat_interval.as_millis(),
        session_buffer = config.session.buffer,
        max_streams = config.session.max_streams,
        price_change_pct = %config.threshold.price_change_pct,
        volume_change_pct = %config.threshold.volume_change_pct,
        max_staleness_ms = config.threshold.max_staleness_ms,
        "Gateway tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT) or an internal cancel.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::info!("Internal shutdown requested");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Waiting for connections to drain"
    );
}
