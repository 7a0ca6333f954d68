//! Reconnection Policy
//!
//! Linear backoff for the upstream feed: the n-th consecutive attempt
//! waits `min(n * base_delay, cap_delay)`. The attempt counter resets when
//! a connection reaches OPEN. With `max_attempts` unset, retries continue
//! forever.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay unit multiplied by the attempt number.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub cap_delay: Duration,
    /// Maximum consecutive attempts before giving up (`None` = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            cap_delay: Duration::from_millis(2000),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(base_delay: Duration, cap_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            cap_delay,
            max_attempts,
        }
    }
}

/// Reconnection policy implementing capped linear backoff.
///
/// # Example
///
/// ```rust
/// use market_data_gateway::infrastructure::upstream::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(50)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
///
/// // Connection reached OPEN
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Register another attempt and return how long to wait before it.
    ///
    /// Returns `None` once `max_attempts` consecutive attempts were used.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;

        let linear = self.config.base_delay.saturating_mul(self.attempt_count);
        Some(linear.min(self.config.cap_delay))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        match self.config.max_attempts {
            Some(max) => self.attempt_count < max,
            None => true,
        }
    }
}
