//! Market Data Streaming Types
//!
//! Core domain types for the fan-out path: stream identifiers, the data
//! frame forwarded to clients, and the numeric tick value the threshold
//! gate compares against its baseline.
//!
//! # Tick Extraction
//!
//! Upstream payloads are opaque JSON objects. The gate only needs a price
//! and optionally a volume, which are pulled from the well-known fields of
//! each stream kind:
//!
//! | Stream kind             | Price            | Volume   |
//! |-------------------------|------------------|----------|
//! | `ticker`, `miniTicker`  | `c`              | `v`      |
//! | `trade`, `aggTrade`     | `p`              | `q`      |
//! | `kline_*`               | `k.c`            | `k.v`    |
//! | `bookTicker`            | mid of `b`, `a`  | none     |
//!
//! Payloads without a recognisable price yield `None` and are forwarded
//! without gating.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

// =============================================================================
// Identifiers
// =============================================================================

/// A stream identifier (e.g. `btcusdt@ticker`).
pub type StreamId = String;

/// Opaque identifier of one downstream client session.
pub type SubscriberId = u64;

/// Maximum accepted length of a stream identifier.
pub const MAX_STREAM_ID_LEN: usize = 128;

/// Reasons a raw stream identifier is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamIdError {
    /// Identifier was empty after trimming.
    #[error("stream id is empty")]
    Empty,

    /// Identifier exceeded [`MAX_STREAM_ID_LEN`].
    #[error("stream id exceeds {MAX_STREAM_ID_LEN} characters")]
    TooLong,

    /// Identifier contained whitespace or control characters.
    #[error("stream id contains whitespace or control characters: {0:?}")]
    InvalidCharacters(String),
}

/// Normalise a raw stream identifier.
///
/// Trims surrounding whitespace and lowercases the symbol part (before
/// `@`) so that `BTCUSDT@ticker` and `btcusdt@ticker` share one upstream
/// subscription. Channel names such as `aggTrade` keep their case.
///
/// # Errors
///
/// Returns [`StreamIdError`] when the identifier is empty, too long, or
/// contains interior whitespace or control characters.
pub fn normalize_stream_id(raw: &str) -> Result<StreamId, StreamIdError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StreamIdError::Empty);
    }
    if trimmed.chars().count() > MAX_STREAM_ID_LEN {
        return Err(StreamIdError::TooLong);
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(StreamIdError::InvalidCharacters(trimmed.to_string()));
    }
    Ok(match trimmed.split_once('@') {
        Some((symbol, channel)) => format!("{}@{channel}", symbol.to_lowercase()),
        None => trimmed.to_lowercase(),
    })
}

// =============================================================================
// Frames
// =============================================================================

/// A data frame forwarded to downstream clients.
///
/// Serializes as `{"stream": "...", "data": {...}}`, the same shape the
/// upstream feed uses for combined streams.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamFrame {
    /// Stream the tick belongs to.
    pub stream: StreamId,
    /// Raw tick payload as received from upstream.
    pub data: Value,
}

impl StreamFrame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(stream: StreamId, data: Value) -> Self {
        Self { stream, data }
    }
}

/// Direction of an upstream subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMethod {
    /// Start receiving a stream.
    Subscribe,
    /// Stop receiving a stream.
    Unsubscribe,
}

impl SubscriptionMethod {
    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

// =============================================================================
// Tick Value
// =============================================================================

/// The numeric view of a tick used for threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickValue {
    /// Last or mid price.
    pub price: Decimal,
    /// Traded volume, if the stream carries one.
    pub volume: Option<Decimal>,
}

impl TickValue {
    /// Create a tick value.
    #[must_use]
    pub const fn new(price: Decimal, volume: Option<Decimal>) -> Self {
        Self { price, volume }
    }

    /// Extract a tick value from an upstream payload.
    ///
    /// Returns `None` when the payload carries no recognisable price or
    /// the book mid is not representable.
    #[must_use]
    pub fn from_payload(data: &Value) -> Option<Self> {
        let obj = data.as_object()?;

        if let Some(kline) = obj.get("k").and_then(Value::as_object) {
            let price = kline.get("c").and_then(decimal_field)?;
            let volume = kline.get("v").and_then(decimal_field);
            return Some(Self::new(price, volume));
        }

        if let Some(price) = obj.get("c").and_then(decimal_field) {
            return Some(Self::new(price, obj.get("v").and_then(decimal_field)));
        }

        if let Some(price) = obj.get("p").and_then(decimal_field) {
            return Some(Self::new(price, obj.get("q").and_then(decimal_field)));
        }

        let bid = obj.get("b").and_then(decimal_field)?;
        let ask = obj.get("a").and_then(decimal_field)?;
        let mid = bid.checked_add(ask)?.checked_div(Decimal::TWO)?;
        Some(Self::new(mid, None))
    }
}

/// Parse a decimal carried as a JSON string or number.
fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

// =============================================================================
// Tests
// =============================================================================
