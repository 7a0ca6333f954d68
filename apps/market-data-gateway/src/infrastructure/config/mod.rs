//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_UPSTREAM_URL, FanoutMode, FanoutSettings, GatewayConfig, ServerSettings,
    SessionSettings, UpstreamSettings,
};
