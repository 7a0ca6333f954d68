//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Optional values that fail to parse fall back to their defaults; an empty
//! upstream URL or a negative threshold is an error.

use std::str::FromStr;
use std::time::Duration;

use crate::domain::threshold::{ThresholdConfig, ThresholdConfigError};
use crate::infrastructure::heartbeat::HeartbeatConfig;
use crate::infrastructure::upstream::UpstreamConfig;
use crate::infrastructure::upstream::reconnect::ReconnectConfig;

/// Default combined-stream endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://stream.binance.com:9443/stream";

/// Upstream feed connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// WebSocket URL of the exchange feed.
    pub url: String,
    /// Linear backoff unit.
    pub reconnect_base_delay: Duration,
    /// Upper bound on one backoff delay.
    pub reconnect_cap_delay: Duration,
    /// Consecutive attempts before FAILED (`None` = unlimited).
    pub max_reconnect_attempts: Option<u32>,
    /// Interval between upstream pings.
    pub ping_interval: Duration,
    /// How long an upstream ping may stay unanswered.
    pub pong_timeout: Duration,
    /// Bound on the CONNECTING state.
    pub connect_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            reconnect_base_delay: Duration::from_millis(50),
            reconnect_cap_delay: Duration::from_millis(2000),
            max_reconnect_attempts: None,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Downstream session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Ping interval; a ping unanswered by the next tick closes the session.
    pub heartbeat_interval: Duration,
    /// Outbound frames buffered per session before drops start.
    pub buffer: usize,
    /// Streams one session may hold at once.
    pub max_streams: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(30_000),
            buffer: 1024,
            max_streams: 200,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Downstream WebSocket port.
    pub gateway_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            gateway_port: 8080,
            health_port: 8082,
        }
    }
}

/// Fan-out mirror backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutMode {
    /// No mirror.
    #[default]
    Disabled,
    /// In-process cache and pub/sub.
    Memory,
}

impl FanoutMode {
    /// Parse mode from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "memory" => Self::Memory,
            _ => Self::Disabled,
        }
    }

    /// Mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Memory => "memory",
        }
    }
}

/// Fan-out mirror settings.
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Backend selection.
    pub mode: FanoutMode,
    /// Lifetime of the last-tick cache entries.
    pub ttl: Duration,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            mode: FanoutMode::Disabled,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream connection settings.
    pub upstream: UpstreamSettings,
    /// Downstream session settings.
    pub session: SessionSettings,
    /// Initial threshold gate configuration.
    pub threshold: ThresholdConfig,
    /// Fan-out mirror settings.
    pub fanout: FanoutSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(lookup);

        let url = match env.get("UPSTREAM_WS_URL") {
            Some(url) if url.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("UPSTREAM_WS_URL".to_string()));
            }
            Some(url) => url.trim().to_string(),
            None => DEFAULT_UPSTREAM_URL.to_string(),
        };

        let defaults = Self::default();

        let server = ServerSettings {
            gateway_port: env.parse("GATEWAY_PORT", defaults.server.gateway_port),
            health_port: env.parse("GATEWAY_HEALTH_PORT", defaults.server.health_port),
        };

        let upstream = UpstreamSettings {
            url,
            reconnect_base_delay: env.millis(
                "GATEWAY_RECONNECT_BASE_DELAY_MS",
                defaults.upstream.reconnect_base_delay,
            ),
            reconnect_cap_delay: env.millis(
                "GATEWAY_RECONNECT_CAP_DELAY_MS",
                defaults.upstream.reconnect_cap_delay,
            ),
            max_reconnect_attempts: env
                .get("GATEWAY_MAX_RECONNECT_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok()),
            ping_interval: env.secs(
                "GATEWAY_UPSTREAM_PING_INTERVAL_SECS",
                defaults.upstream.ping_interval,
            ),
            pong_timeout: env.secs(
                "GATEWAY_UPSTREAM_PONG_TIMEOUT_SECS",
                defaults.upstream.pong_timeout,
            ),
            connect_timeout: env.millis(
                "GATEWAY_CONNECT_TIMEOUT_MS",
                defaults.upstream.connect_timeout,
            ),
        };

        let session = SessionSettings {
            heartbeat_interval: env.millis(
                "GATEWAY_HEARTBEAT_INTERVAL_MS",
                defaults.session.heartbeat_interval,
            ),
            buffer: env.parse("GATEWAY_SESSION_BUFFER", defaults.session.buffer).max(1),
            max_streams: env.parse(
                "GATEWAY_MAX_STREAMS_PER_SESSION",
                defaults.session.max_streams,
            ),
        };

        let threshold = ThresholdConfig {
            price_change_pct: env.parse(
                "GATEWAY_PRICE_CHANGE_PCT",
                defaults.threshold.price_change_pct,
            ),
            volume_change_pct: env.parse(
                "GATEWAY_VOLUME_CHANGE_PCT",
                defaults.threshold.volume_change_pct,
            ),
            max_staleness_ms: env.parse(
                "GATEWAY_MAX_STALENESS_MS",
                defaults.threshold.max_staleness_ms,
            ),
        };
        threshold.validate()?;

        let fanout = FanoutSettings {
            mode: env
                .get("GATEWAY_FANOUT_MIRROR")
                .map(|s| FanoutMode::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            ttl: env.secs("GATEWAY_FANOUT_TTL_SECS", defaults.fanout.ttl),
        };

        Ok(Self {
            server,
            upstream,
            session,
            threshold,
            fanout,
        })
    }

    /// Build the upstream connection configuration.
    #[must_use]
    pub fn upstream_config(&self) -> UpstreamConfig {
        let upstream = &self.upstream;
        UpstreamConfig {
            url: upstream.url.clone(),
            reconnect: ReconnectConfig::new(
                upstream.reconnect_base_delay,
                upstream.reconnect_cap_delay,
                upstream.max_reconnect_attempts,
            ),
            heartbeat: HeartbeatConfig::new(upstream.ping_interval, upstream.pong_timeout),
            connect_timeout: upstream.connect_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Threshold values out of range.
    #[error("invalid threshold configuration: {0}")]
    Threshold(#[from] ThresholdConfigError),
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rust_decimal_macros::dec;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.upstream.url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.server.gateway_port, 8080);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(config.threshold, ThresholdConfig::default());
        assert_eq!(config.upstream.reconnect_base_delay, Duration::from_millis(50));
        assert_eq!(config.upstream.reconnect_cap_delay, Duration::from_millis(2000));
        assert_eq!(config.upstream.max_reconnect_attempts, None);
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.session.max_streams, 200);
        assert_eq!(config.fanout.mode, FanoutMode::Disabled);
    }

    #[test]
    fn values_from_environment() {
        let config = config_from(&[
            ("UPSTREAM_WS_URL", " ws://localhost:9000/stream "),
            ("GATEWAY_PORT", "9001"),
            ("GATEWAY_PRICE_CHANGE_PCT", "0.25"),
            ("GATEWAY_VOLUME_CHANGE_PCT", "2"),
            ("GATEWAY_MAX_STALENESS_MS", "1000"),
            ("GATEWAY_MAX_RECONNECT_ATTEMPTS", "5"),
            ("GATEWAY_HEARTBEAT_INTERVAL_MS", "250"),
            ("GATEWAY_FANOUT_MIRROR", "Memory"),
            ("GATEWAY_FANOUT_TTL_SECS", "5"),
        ])
        .unwrap();

        assert_eq!(config.upstream.url, "ws://localhost:9000/stream");
        assert_eq!(config.server.gateway_port, 9001);
        assert_eq!(config.threshold.price_change_pct, dec!(0.25));
        assert_eq!(config.threshold.volume_change_pct, dec!(2));
        assert_eq!(config.threshold.max_staleness_ms, 1000);
        assert_eq!(config.upstream.max_reconnect_attempts, Some(5));
        assert_eq!(config.session.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.fanout.mode, FanoutMode::Memory);
        assert_eq!(config.fanout.ttl, Duration::from_secs(5));
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = config_from(&[
            ("GATEWAY_PORT", "not-a-port"),
            ("GATEWAY_PRICE_CHANGE_PCT", "lots"),
            ("GATEWAY_MAX_RECONNECT_ATTEMPTS", "forever"),
        ])
        .unwrap();

        assert_eq!(config.server.gateway_port, 8080);
        assert_eq!(config.threshold.price_change_pct, dec!(0.1));
        assert_eq!(config.upstream.max_reconnect_attempts, None);
    }

    #[test]
    fn empty_url_is_an_error() {
        assert!(matches!(
            config_from(&[("UPSTREAM_WS_URL", "  ")]),
            Err(ConfigError::EmptyValue(key)) if key == "UPSTREAM_WS_URL"
        ));
    }

    #[test]
    fn negative_threshold_is_an_error() {
        assert!(matches!(
            config_from(&[("GATEWAY_PRICE_CHANGE_PCT", "-1")]),
            Err(ConfigError::Threshold(_))
        ));
    }

    #[test]
    fn upstream_config_carries_timings() {
        let config = config_from(&[
            ("GATEWAY_RECONNECT_BASE_DELAY_MS", "10"),
            ("GATEWAY_RECONNECT_CAP_DELAY_MS", "40"),
            ("GATEWAY_MAX_RECONNECT_ATTEMPTS", "3"),
            ("GATEWAY_UPSTREAM_PING_INTERVAL_SECS", "7"),
        ])
        .unwrap();

        let upstream = config.upstream_config();
        assert_eq!(upstream.reconnect.base_delay, Duration::from_millis(10));
        assert_eq!(upstream.reconnect.cap_delay, Duration::from_millis(40));
        assert_eq!(upstream.reconnect.max_attempts, Some(3));
        assert_eq!(upstream.heartbeat.ping_interval, Duration::from_secs(7));
    }

    #[test]
    fn fanout_mode_parsing() {
        assert_eq!(FanoutMode::from_str_case_insensitive("memory"), FanoutMode::Memory);
        assert_eq!(FanoutMode::from_str_case_insensitive("MEMORY"), FanoutMode::Memory);
        assert_eq!(FanoutMode::from_str_case_insensitive("redis"), FanoutMode::Disabled);
        assert_eq!(FanoutMode::Memory.as_str(), "memory");
    }
}
