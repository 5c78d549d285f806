//! Message envelope convention.
//!
//! When a publisher supplies a message type, the raw body is wrapped as
//! `{"messageType": <type>, "message": <body>}` before it reaches the broker.
//! The body is embedded as a JSON value when it parses as JSON and as a plain
//! string otherwise. Without a message type the body is sent verbatim.
//!
//! Encoding never fails: a body that is not JSON is simply treated as text.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;

/// Typed wrapper around a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "messageType")]
    pub message_type: String,
    pub message: Value,
}

impl Envelope {
    /// Wrap a raw body, parsing it as JSON where possible
    pub fn wrap(body: &[u8], message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            message: try_parse(body).into_value(),
        }
    }

    /// Deserialize the wrapped message into a concrete type
    pub fn message_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.message)
    }
}

/// Outcome of a best-effort structured parse
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    /// The body was valid JSON
    Structured(Value),
    /// The body was not JSON; holds its (lossily decoded) text
    Text(String),
}

impl ParsedBody {
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    /// Convert into a JSON value, text becoming a JSON string
    pub fn into_value(self) -> Value {
        match self {
            Self::Structured(value) => value,
            Self::Text(text) => Value::String(text),
        }
    }
}

/// Parse a body as JSON, falling back to its text
pub fn try_parse(body: &[u8]) -> ParsedBody {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => ParsedBody::Structured(value),
        Err(_) => ParsedBody::Text(String::from_utf8_lossy(body).into_owned()),
    }
}

/// Produce the wire payload for a body and optional message type.
///
/// An empty `message_type` returns the body unchanged.
pub fn encode(body: &[u8], message_type: &str) -> Bytes {
    if message_type.is_empty() {
        return Bytes::copy_from_slice(body);
    }

    let envelope = Envelope::wrap(body, message_type);
    match serde_json::to_vec(&envelope) {
        Ok(encoded) => Bytes::from(encoded),
        Err(e) => {
            // Not expected for a String + Value pair.
            warn!(error = %e, message_type, "Failed to serialize envelope, sending raw body");
            Bytes::copy_from_slice(body)
        }
    }
}

/// Recover an envelope from a received payload.
///
/// Payloads delivered to SQS through an SNS subscription arrive wrapped in an
/// SNS notification document; the inner `Message` is unwrapped first.
/// Returns `None` when the payload is not an envelope.
pub fn decode(payload: &[u8]) -> Option<Envelope> {
    let value: Value = serde_json::from_slice(payload).ok()?;

    if let Some(inner) = sns_notification_message(&value) {
        return decode(inner.as_bytes());
    }

    serde_json::from_value(value).ok()
}

fn sns_notification_message(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.get("Type")?.as_str()? != "Notification" {
        return None;
    }
    object.get("Message")?.as_str()
}
