//! Downstream Client Protocol
//!
//! Requests are JSON objects tagged by `method`:
//!
//! ```json
//! {"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}
//! {"method": "UNSUBSCRIBE", "params": ["btcusdt@ticker"], "id": 2}
//! {"method": "LIST_SUBSCRIPTIONS", "id": 3}
//! {"method": "PING", "id": 4}
//! {"method": "AUTH", "params": ["<token>"], "id": 5}
//! ```
//!
//! Server frames:
//!
//! ```json
//! {"result": null, "id": 1}
//! {"result": ["btcusdt@ticker"], "id": 3}
//! {"result": "pong", "id": 4}
//! {"type": "error", "message": "..."}
//! {"type": "welcome", "subscriberId": 7, "compression": "gzip"}
//! {"stream": "btcusdt@ticker", "data": {...}}
//! ```
//!
//! The `id` is echoed verbatim and may be any JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::ports::AuthError;
use crate::domain::streaming::{StreamId, StreamIdError, normalize_stream_id};
use crate::infrastructure::codec::Compression;

const METHODS: [&str; 5] = [
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "LIST_SUBSCRIPTIONS",
    "PING",
    "AUTH",
];

// =============================================================================
// Requests
// =============================================================================

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRequest {
    /// Subscribe to streams.
    Subscribe {
        /// Raw stream identifiers.
        #[serde(default)]
        params: Vec<String>,
        /// Request id.
        #[serde(default)]
        id: Value,
    },
    /// Unsubscribe from streams.
    Unsubscribe {
        /// Raw stream identifiers.
        #[serde(default)]
        params: Vec<String>,
        /// Request id.
        #[serde(default)]
        id: Value,
    },
    /// List the session's streams.
    ListSubscriptions {
        /// Request id.
        #[serde(default)]
        id: Value,
    },
    /// Application-level ping.
    Ping {
        /// Request id.
        #[serde(default)]
        id: Value,
    },
    /// Present a credential.
    Auth {
        /// `[token]`.
        #[serde(default)]
        params: Vec<String>,
        /// Alternative to `params`.
        #[serde(default)]
        token: Option<String>,
        /// Request id.
        #[serde(default)]
        id: Value,
    },
}

impl ClientRequest {
    /// Parse a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object with a known
    /// `method` and well-typed fields.
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let method = value
            .get("method")
            .ok_or(RequestError::MissingMethod)?
            .as_str()
            .ok_or(RequestError::MissingMethod)?;

        if !METHODS.contains(&method) {
            return Err(RequestError::UnknownMethod(method.to_string()));
        }

        serde_json::from_value(value).map_err(|e| RequestError::InvalidRequest(e.to_string()))
    }

    /// Parse request text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON or not a valid request.
    pub fn from_text(text: &str) -> Result<Self, RequestError> {
        let value = serde_json::from_str(text).map_err(|e| RequestError::MalformedJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// The request id.
    #[must_use]
    pub const fn id(&self) -> &Value {
        match self {
            Self::Subscribe { id, .. }
            | Self::Unsubscribe { id, .. }
            | Self::ListSubscriptions { id }
            | Self::Ping { id }
            | Self::Auth { id, .. } => id,
        }
    }
}

/// Validate and normalise a stream list.
///
/// Duplicates collapse to their first occurrence.
///
/// # Errors
///
/// Returns an error for an empty list or any invalid identifier.
pub fn validate_streams(params: &[String]) -> Result<Vec<StreamId>, RequestError> {
    if params.is_empty() {
        return Err(RequestError::EmptyParams);
    }

    let mut streams: Vec<StreamId> = Vec::with_capacity(params.len());
    for raw in params {
        let stream = normalize_stream_id(raw).map_err(|source| RequestError::InvalidStream {
            stream: raw.clone(),
            source,
        })?;
        if !streams.contains(&stream) {
            streams.push(stream);
        }
    }
    Ok(streams)
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Not valid JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// No string `method` field.
    #[error("request has no method")]
    MissingMethod,

    /// Unsupported method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Fields have the wrong shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A stream list was empty.
    #[error("params must list at least one stream")]
    EmptyParams,

    /// A stream identifier failed validation.
    #[error("invalid stream {stream:?}: {source}")]
    InvalidStream {
        /// The identifier as sent.
        stream: String,
        /// Validation failure.
        source: StreamIdError,
    },

    /// The session would exceed its stream limit.
    #[error("subscription limit of {limit} streams exceeded")]
    TooManyStreams {
        /// Configured limit.
        limit: usize,
    },

    /// Subscribing before a successful AUTH.
    #[error("authentication required")]
    Unauthenticated,

    /// AUTH without a token.
    #[error("AUTH requires a token")]
    MissingToken,

    /// The authenticator rejected the token.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The decoded frame was not usable.
    #[error("undecodable frame: {0}")]
    Undecodable(String),
}

// =============================================================================
// Server Frames
// =============================================================================

/// Typed notice frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notice {
    /// Request or upstream failure.
    Error {
        /// Human readable message.
        message: String,
    },
    /// First frame of every session.
    Welcome {
        /// The session's subscriber id.
        #[serde(rename = "subscriberId")]
        subscriber_id: u64,
        /// Negotiated compression.
        compression: &'static str,
    },
}

/// A non-data frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Response to a request.
    Response {
        /// Result value.
        result: Value,
        /// Echoed request id.
        id: Value,
    },
    /// Notice frame.
    Notice(Notice),
}

impl ServerFrame {
    /// `{"result": null, "id": id}`.
    #[must_use]
    pub const fn ack(id: Value) -> Self {
        Self::Response {
            result: Value::Null,
            id,
        }
    }

    /// Response with a result.
    #[must_use]
    pub const fn result(result: Value, id: Value) -> Self {
        Self::Response { result, id }
    }

    /// Error notice.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Notice(Notice::Error {
            message: message.into(),
        })
    }

    /// Welcome notice.
    #[must_use]
    pub const fn welcome(subscriber_id: u64, compression: Compression) -> Self {
        Self::Notice(Notice::Welcome {
            subscriber_id,
            compression: compression.as_str(),
        })
    }

    /// Whether this is an error notice.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Notice(Notice::Error { .. }))
    }
}

impl From<RequestError> for ServerFrame {
    fn from(error: RequestError) -> Self {
        Self::error(error.to_string())
    }
}
