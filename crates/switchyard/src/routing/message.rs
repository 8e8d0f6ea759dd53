//! Wire message envelope: `{"type": ..., "action": ..., "data": ...}`.

use crate::errors::SwitchyardError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest inbound text frame accepted by the router (64 KiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Why an inbound frame was rejected before routing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("frame is not valid JSON")]
    InvalidJson,

    #[error("frame must be a JSON object")]
    NotAnObject,

    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>, action: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            action: action.into(),
            data,
        }
    }

    /// Error envelope sent to a client: `{type: "error", action, data: {message}}`.
    pub fn error(action: &str, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("message".to_string(), Value::String(message.into()));
        Self::new("error", action, Value::Object(data))
    }

    /// Error envelope for a [`SwitchyardError`], with its client-safe message.
    pub fn from_error(error: &SwitchyardError) -> Self {
        Self::error(error.error_action(), error.client_message())
    }

    /// Parse an inbound text frame.
    ///
    /// `type` and `action` must be non-empty strings; `data` is optional.
    pub fn parse(raw: &str) -> Result<Self, MessageParseError> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(MessageParseError::TooLarge {
                size: raw.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        let value: Value = serde_json::from_str(raw).map_err(|_| MessageParseError::InvalidJson)?;
        let Value::Object(mut object) = value else {
            return Err(MessageParseError::NotAnObject);
        };

        let kind = take_required_string(&mut object, "type")?;
        let action = take_required_string(&mut object, "action")?;
        let data = object.remove("data").unwrap_or(Value::Null);

        Ok(Self { kind, action, data })
    }

    /// Serialize for sending.
    pub fn to_json(&self) -> Result<String, SwitchyardError> {
        serde_json::to_string(self)
            .map_err(|e| SwitchyardError::Internal(format!("failed to encode message: {e}")))
    }

    /// String field of `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

fn take_required_string(
    object: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, MessageParseError> {
    match object.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(MessageParseError::MissingField(field)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_message() {
        let msg = WireMessage::parse(r#"{"type":"room","action":"join","data":{"room":"lobby"}}"#)
            .unwrap();
        assert_eq!(msg.kind, "room");
        assert_eq!(msg.action, "join");
        assert_eq!(msg.data_str("room"), Some("lobby"));
    }

    #[test]
    fn test_parse_without_data() {
        let msg = WireMessage::parse(r#"{"type":"system","action":"ping"}"#).unwrap();
        assert_eq!(msg.data, Value::Null);
    }

    #[test]
    fn test_parse_rejects_invalid_frames() {
        assert_eq!(
            WireMessage::parse("not json"),
            Err(MessageParseError::InvalidJson)
        );
        assert_eq!(
            WireMessage::parse("[1,2]"),
            Err(MessageParseError::NotAnObject)
        );
        assert_eq!(
            WireMessage::parse(r#"{"action":"ping"}"#),
            Err(MessageParseError::MissingField("type"))
        );
        assert_eq!(
            WireMessage::parse(r#"{"type":"system","action":""}"#),
            Err(MessageParseError::MissingField("action"))
        );
        assert_eq!(
            WireMessage::parse(r#"{"type":7,"action":"ping"}"#),
            Err(MessageParseError::MissingField("type"))
        );
    }

    #[test]
    fn test_parse_rejects_oversized_frame() {
        let padding = "x".repeat(MAX_FRAME_BYTES);
        let raw = format!(r#"{{"type":"a","action":"b","data":"{padding}"}}"#);
        assert!(matches!(
            WireMessage::parse(&raw),
            Err(MessageParseError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_serialization_uses_type_key_and_omits_null_data() {
        let msg = WireMessage::new("system", "pong", Value::Null);
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"system","action":"pong"}"#);
    }

    #[test]
    fn test_error_envelope() {
        let err = SwitchyardError::HandlerNotFound {
            kind: "chat".to_string(),
            action: "send".to_string(),
        };
        let msg = WireMessage::from_error(&err);
        assert_eq!(msg.kind, "error");
        assert_eq!(msg.action, "handler_not_found");
        assert_eq!(msg.data, json!({"message": "No handler for chat/send"}));
    }
}
