//! Threshold Gate
//!
//! Per-stream change filter deciding whether a new tick differs enough from
//! the last *forwarded* value to be worth sending downstream.
//!
//! # Policy
//!
//! A tick is forwarded when any of these hold:
//!
//! - no baseline exists for the stream (cold start)
//! - `|price - baseline.price| / baseline.price * 100 >= price_change_pct`
//! - `|volume - baseline.volume| / baseline.volume * 100 >= volume_change_pct`
//!   (only when both volumes are present and non-zero)
//! - `now - baseline.timestamp >= max_staleness_ms`
//!
//! The baseline is replaced only on forward. Comparing against the last
//! forwarded value bounds staleness even under a long run of sub-threshold
//! ticks that would otherwise each look insignificant.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::streaming::{StreamId, TickValue};

// =============================================================================
// Configuration
// =============================================================================

/// Process-wide threshold settings, mutable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    /// Minimum price change (percent) that forces a forward.
    #[serde(with = "rust_decimal::serde::float")]
    pub price_change_pct: Decimal,
    /// Minimum volume change (percent) that forces a forward.
    #[serde(with = "rust_decimal::serde::float")]
    pub volume_change_pct: Decimal,
    /// Maximum age of a baseline before the next tick is forwarded anyway.
    pub max_staleness_ms: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            price_change_pct: Decimal::new(1, 1),
            volume_change_pct: Decimal::ONE,
            max_staleness_ms: 5000,
        }
    }
}

/// Invalid threshold settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThresholdConfigError {
    /// A percentage threshold was negative.
    #[error("{field} must not be negative, got {value}")]
    NegativePercentage {
        /// Offending field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },
}

impl ThresholdConfig {
    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if either percentage is negative.
    pub fn validate(&self) -> Result<(), ThresholdConfigError> {
        if self.price_change_pct < Decimal::ZERO {
            return Err(ThresholdConfigError::NegativePercentage {
                field: "priceChangePct",
                value: self.price_change_pct,
            });
        }
        if self.volume_change_pct < Decimal::ZERO {
            return Err(ThresholdConfigError::NegativePercentage {
                field: "volumeChangePct",
                value: self.volume_change_pct,
            });
        }
        Ok(())
    }

    /// Staleness bound as a [`Duration`].
    #[must_use]
    pub const fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }
}

// =============================================================================
// Baseline
// =============================================================================

/// Last forwarded value for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline {
    /// Forwarded price.
    pub price: Decimal,
    /// Forwarded volume, if any.
    pub volume: Option<Decimal>,
    /// When the value was forwarded.
    pub timestamp: Instant,
}

impl Baseline {
    const fn from_tick(tick: &TickValue, timestamp: Instant) -> Self {
        Self {
            price: tick.price,
            volume: tick.volume,
            timestamp,
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

/// Per-stream change filter.
///
/// Not synchronised; the owner serialises access together with the
/// subscription table.
#[derive(Debug, Default)]
pub struct ThresholdGate {
    config: ThresholdConfig,
    baselines: HashMap<StreamId, Baseline>,
}

impl ThresholdGate {
    /// Create a gate with the given settings.
    #[must_use]
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            baselines: HashMap::new(),
        }
    }

    /// Decide whether `tick` should be forwarded, updating the baseline
    /// when it is.
    pub fn should_forward(&mut self, stream: &str, tick: &TickValue) -> bool {
        self.should_forward_at(stream, tick, Instant::now())
    }

    /// [`Self::should_forward`] with an explicit clock reading.
    pub fn should_forward_at(&mut self, stream: &str, tick: &TickValue, now: Instant) -> bool {
        let Some(baseline) = self.baselines.get_mut(stream) else {
            self.baselines
                .insert(stream.to_string(), Baseline::from_tick(tick, now));
            return true;
        };

        let forward = exceeds(baseline.price, tick.price, self.config.price_change_pct)
            || volume_exceeds(baseline.volume, tick.volume, self.config.volume_change_pct)
            || now.saturating_duration_since(baseline.timestamp) >= self.config.max_staleness();

        if forward {
            *baseline = Baseline::from_tick(tick, now);
        }
        forward
    }

    /// Drop the baseline for a stream nobody wants anymore.
    pub fn forget(&mut self, stream: &str) {
        self.baselines.remove(stream);
    }

    /// Current baseline for a stream.
    #[must_use]
    pub fn baseline(&self, stream: &str) -> Option<&Baseline> {
        self.baselines.get(stream)
    }

    /// Number of streams with a baseline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    /// Whether no baselines are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Current settings.
    #[must_use]
    pub const fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Replace the settings. Existing baselines are kept.
    pub const fn set_config(&mut self, config: ThresholdConfig) {
        self.config = config;
    }
}

/// Percentage change from `base` to `value` reaches `pct`.
///
/// A zero base makes any change significant, and so does a change too
/// large to represent.
fn exceeds(base: Decimal, value: Decimal, pct: Decimal) -> bool {
    if base.is_zero() {
        return value != base;
    }
    value
        .checked_sub(base)
        .and_then(|diff| diff.abs().checked_div(base.abs()))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .is_none_or(|delta| delta >= pct)
}

fn volume_exceeds(base: Option<Decimal>, value: Option<Decimal>, pct: Decimal) -> bool {
    match (base, value) {
        (Some(base), Some(value)) if !base.is_zero() && !value.is_zero() => {
            exceeds(base, value, pct)
        }
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
