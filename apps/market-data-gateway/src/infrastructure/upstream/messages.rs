//! Upstream Feed Message Types
//!
//! Wire format of the exchange stream endpoint.
//!
//! # Outbound
//!
//! ```json
//! {"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}
//! ```
//!
//! # Inbound
//!
//! - Combined stream data: `{"stream": "btcusdt@ticker", "data": {...}}`
//! - Request response: `{"result": null, "id": 1}`
//! - Request error: `{"error": {"code": 2, "msg": "..."}, "id": 1}`
//! - Raw event (single-stream endpoint): `{"e": "24hrTicker", "s": "BTCUSDT", ...}`
//!
//! Raw events carry no stream name; it is derived from the event type and
//! symbol so that they route like combined-stream data.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::streaming::{StreamId, SubscriptionMethod};

/// A SUBSCRIBE/UNSUBSCRIBE request sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamRequest {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`.
    pub method: &'static str,
    /// Stream identifiers.
    pub params: Vec<StreamId>,
    /// Request id echoed in the response.
    pub id: u64,
}

impl UpstreamRequest {
    /// Build a request.
    #[must_use]
    pub const fn new(method: SubscriptionMethod, params: Vec<StreamId>, id: u64) -> Self {
        Self {
            method: method.as_str(),
            params,
            id,
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// Market data for one stream.
    Data {
        /// Stream the payload belongs to.
        stream: StreamId,
        /// Raw payload.
        data: Value,
    },
    /// Reply to a request; `error` is set when it was rejected.
    Reply {
        /// Echoed request id.
        id: Option<u64>,
        /// Error body of a rejected request.
        error: Option<Value>,
    },
}

impl UpstreamMessage {
    /// Classify a decoded JSON value.
    ///
    /// Returns `None` for shapes that match none of the known frames.
    #[must_use]
    pub fn classify(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };

        if let Some(Value::String(stream)) = obj.get("stream")
            && obj.contains_key("data")
        {
            let stream = stream.clone();
            let data = obj.remove("data").unwrap_or(Value::Null);
            return Some(Self::Data { stream, data });
        }

        if obj.contains_key("error") || (obj.contains_key("id") && obj.contains_key("result")) {
            let id = obj.get("id").and_then(Value::as_u64);
            return Some(Self::Reply {
                id,
                error: obj.remove("error"),
            });
        }

        let stream = raw_stream_name(&obj)?;
        Some(Self::Data {
            stream,
            data: Value::Object(obj),
        })
    }
}

/// Derive the stream name of a raw single-stream event.
fn raw_stream_name(obj: &Map<String, Value>) -> Option<StreamId> {
    let symbol = obj.get("s").and_then(Value::as_str)?.to_lowercase();

    let suffix = match obj.get("e").and_then(Value::as_str) {
        Some("24hrTicker") => "ticker".to_string(),
        Some("24hrMiniTicker") => "miniTicker".to_string(),
        Some("trade") => "trade".to_string(),
        Some("aggTrade") => "aggTrade".to_string(),
        Some("depthUpdate") => "depth".to_string(),
        Some("kline") => {
            let interval = obj.get("k")?.get("i")?.as_str()?;
            format!("kline_{interval}")
        }
        Some(_) => return None,
        // Book ticker events carry no event type.
        None if obj.contains_key("b") && obj.contains_key("a") => "bookTicker".to_string(),
        None => return None,
    };

    Some(format!("{symbol}@{suffix}"))
}
