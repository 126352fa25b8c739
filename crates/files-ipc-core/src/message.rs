//! JSON-RPC 2.0 envelope.
//!
//! Every frame that crosses a transport is one [`Message`]. The envelope is
//! parsed once, validated once, and immutable afterwards; the runtime
//! dispatches on it and the send queues carry its serialized form.
//!
//! # Shape invariants
//!
//! - `jsonrpc` must be exactly `"2.0"`.
//! - `result` and `error` are mutually exclusive.
//! - A request has `method` and `id`; a notification has `method` and no
//!   `id`; a response has `id` and exactly one of `result` / `error`.
//!
//! # Correlation ids
//!
//! The `id` is opaque — string, number, or the `null` literal — and is
//! preserved byte-for-byte on replies. Absent and `null` are distinct
//! states (`null` still serializes as `"id": null`), which is why the field
//! is kept as an `Option<Value>` populated through a custom deserializer
//! instead of relying on serde's default null-to-`None` collapse.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: &str = "2.0";

/// JSON-RPC error codes used on the wire.
///
/// The negative 32xxx block is reserved by JSON-RPC 2.0; the −32001..−32004
/// block is this server's application range. −32001 is overloaded between
/// "authentication required" and "no shell available"; callers disambiguate
/// by message.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The envelope violated a shape invariant.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method is not registered.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Bad params, rejected path, or payload over the method cap.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Anything unexpected; message is always scrubbed.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Authentication required, or no shell available.
    pub const AUTH_REQUIRED: i64 = -32001;
    /// The presented token did not match.
    pub const INVALID_TOKEN: i64 = -32002;
    /// The session's token bucket is empty.
    pub const RATE_LIMITED: i64 = -32003;
    /// The session authenticated under an older epoch.
    pub const SESSION_EXPIRED: i64 = -32004;
}

/// Error payload of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric code from the table in [`codes`].
    pub code: i64,
    /// Human-readable, already sanitized for the wire.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A parsed JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version; must equal [`PROTOCOL_VERSION`].
    pub jsonrpc: String,

    /// Correlation id. `None` = absent, `Some(Value::Null)` = the `null`
    /// literal; both mark a notification but only the latter round-trips
    /// as an explicit `"id": null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,

    /// Method name for requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Parameters for requests and notifications.
    #[serde(
        default,
        deserialize_with = "deserialize_present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Value>,

    /// Result of a successful response.
    #[serde(
        default,
        deserialize_with = "deserialize_present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,

    /// Error of a failed response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Maps a present JSON value (including `null`) to `Some`, so absence and
/// the `null` literal stay distinguishable after a round trip.
fn deserialize_present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Failure to turn bytes into a [`Message`].
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload was not valid JSON, or not a JSON-RPC object.
    #[error("malformed JSON-RPC payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Serialization failed (should not happen for well-formed values).
    #[error("failed to serialize envelope: {0}")]
    Serialize(serde_json::Error),
}

impl Message {
    /// Parses an envelope from UTF-8 JSON bytes.
    ///
    /// Only syntax is checked here; shape invariants are the domain of
    /// [`Message::is_valid`], so the runtime can answer a malformed shape
    /// with `InvalidRequest` rather than `ParseError`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Malformed`] when the bytes are not a JSON
    /// object with the envelope's fields.
    pub fn from_json(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serializes the envelope to compact JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialize`] if serde rejects the value tree.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Serialize)
    }

    /// Serializes the envelope to a compact JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialize`] if serde rejects the value tree.
    pub fn to_json_string(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Serialize)
    }

    /// Builds a request envelope.
    #[must_use]
    pub fn request(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Builds a notification envelope (no id, so no reply is expected).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Builds a success response carrying the request's id verbatim.
    #[must_use]
    pub fn result(id: Option<Value>, value: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: Some(value),
            error: None,
        }
    }

    /// Builds an error response carrying the request's id verbatim.
    ///
    /// A `None` id becomes the `null` literal, matching the JSON-RPC 2.0
    /// convention for errors that could not be correlated.
    #[must_use]
    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// True iff the envelope is a notification: id absent or the `null`
    /// literal.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    /// True iff the envelope satisfies the JSON-RPC 2.0 shape invariants.
    ///
    /// Violations answered with `InvalidRequest` by the runtime:
    /// - version other than `"2.0"`;
    /// - `result` and `error` both present;
    /// - `method` present together with `result` or `error`;
    /// - neither a request/notification (`method`) nor a well-formed
    ///   response (id plus exactly one of `result` / `error`).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.jsonrpc != PROTOCOL_VERSION {
            return false;
        }
        if self.result.is_some() && self.error.is_some() {
            return false;
        }
        if self.method.is_some() {
            return self.result.is_none() && self.error.is_none();
        }
        // No method: must be a response with an id and exactly one outcome.
        self.id.is_some() && (self.result.is_some() ^ self.error.is_some())
    }
}
