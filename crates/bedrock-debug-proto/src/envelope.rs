//! Envelope shapes for the debug-agent protocol.
//!
//! Every envelope is a JSON object carrying an integer `version` and a
//! string `type`. The client originates two shapes: `"request"` envelopes
//! that expect a correlated response, and command envelopes (`"resume"`,
//! `"breakpoints"`, `"stopOnException"`, `"protocol"`, …) that are
//! fire-and-forget and carry their payload flattened next to the tag.
//! Inbound traffic is dispatched on `type`; unrecognized types decode to
//! [`Incoming::Other`] so newer agents don't break older clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Wire `version` stamped on every client-originated envelope.
pub const ENVELOPE_VERSION: i64 = 1;

#[derive(Debug, Error)]
#[error("malformed envelope: {0}")]
pub struct DecodeError(String);

/// The nested payload of a `"request"` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub request_seq: u32,
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub version: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub request: RequestBody,
}

impl RequestEnvelope {
    pub fn new(request_seq: u32, command: impl Into<String>, args: Value) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: "request".to_string(),
            request: RequestBody {
                request_seq,
                command: command.into(),
                args,
            },
        }
    }
}

/// A fire-and-forget envelope: `version`, `type`, and the payload fields
/// flattened alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub version: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl CommandEnvelope {
    /// Build a command envelope. `payload` must be a JSON object or null;
    /// anything else is nested under a `"value"` key rather than lost.
    ///
    /// A `version` field in the payload takes the envelope's version slot
    /// instead of the default tag; the `protocol` handshake envelope
    /// carries the negotiated protocol version there.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let mut payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let version = payload
            .remove("version")
            .and_then(|v| v.as_i64())
            .unwrap_or(ENVELOPE_VERSION);
        Self {
            version,
            kind: kind.into(),
            payload,
        }
    }
}

/// A `"response"` envelope, correlated back to a request by `request_seq`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseEnvelope {
    pub request_seq: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// One decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(ResponseEnvelope),
    /// The inner `event` object, `type` field included.
    Event(Value),
    /// An envelope type this client does not understand; ignored upstream.
    Other(String),
}

/// Decode one frame body into an [`Incoming`] envelope.
///
/// JSON that fails to parse, or envelopes missing their `type` tag or the
/// fields their tag requires, are decode errors and fatal to the
/// connection.
pub fn decode_incoming(bytes: &[u8]) -> Result<Incoming, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| DecodeError(err.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| DecodeError("missing `type` field".to_string()))?;

    match kind.as_str() {
        "response" => {
            let response = serde_json::from_value(value)
                .map_err(|err| DecodeError(format!("bad response envelope: {err}")))?;
            Ok(Incoming::Response(response))
        }
        "event" => {
            let Value::Object(mut map) = value else {
                return Err(DecodeError("event envelope is not an object".to_string()));
            };
            let event = map
                .remove("event")
                .ok_or_else(|| DecodeError("event envelope missing `event` field".to_string()))?;
            Ok(Incoming::Event(event))
        }
        _ => Ok(Incoming::Other(kind)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_envelope_wire_shape() {
        let envelope = RequestEnvelope::new(7, "evaluate", json!({"frameId": 0}));
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({
                "version": 1,
                "type": "request",
                "request": {"request_seq": 7, "command": "evaluate", "args": {"frameId": 0}}
            })
        );
    }

    #[test]
    fn request_envelope_omits_null_args() {
        let envelope = RequestEnvelope::new(1, "pause", Value::Null);
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({
                "version": 1,
                "type": "request",
                "request": {"request_seq": 1, "command": "pause"}
            })
        );
    }

    #[test]
    fn command_envelope_flattens_payload() {
        let envelope = CommandEnvelope::new("stopOnException", json!({"stopOnException": true}));
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({"version": 1, "type": "stopOnException", "stopOnException": true})
        );
    }

    #[test]
    fn payload_version_takes_the_envelope_slot() {
        let envelope = CommandEnvelope::new(
            "protocol",
            json!({"version": 5, "target_module_uuid": "U"}),
        );
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({"version": 5, "type": "protocol", "target_module_uuid": "U"})
        );
    }

    #[test]
    fn command_envelope_with_no_payload() {
        let envelope = CommandEnvelope::new("resume", Value::Null);
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(encoded, json!({"version": 1, "type": "resume"}));
    }

    #[test]
    fn decodes_a_response() {
        let bytes = br#"{"version":1,"type":"response","request_seq":3,"body":{"result":"2"}}"#;
        let Incoming::Response(response) = decode_incoming(bytes).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.request_seq, 3);
        assert_eq!(response.error, None);
        assert_eq!(response.body, json!({"result": "2"}));
    }

    #[test]
    fn decodes_a_response_error() {
        let bytes = br#"{"version":1,"type":"response","request_seq":9,"error":"no frame"}"#;
        let Incoming::Response(response) = decode_incoming(bytes).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.error.as_deref(), Some("no frame"));
        assert_eq!(response.body, Value::Null);
    }

    #[test]
    fn decodes_an_event() {
        let bytes =
            br#"{"version":1,"type":"event","event":{"type":"StoppedEvent","thread":1}}"#;
        let Incoming::Event(event) = decode_incoming(bytes).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(event["type"], "StoppedEvent");
        assert_eq!(event["thread"], 1);
    }

    #[test]
    fn unknown_envelope_types_are_surfaced_not_fatal() {
        let bytes = br#"{"version":2,"type":"telemetry","blob":[1,2,3]}"#;
        assert_eq!(
            decode_incoming(bytes).unwrap(),
            Incoming::Other("telemetry".to_string())
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_incoming(b"not json").is_err());
        assert!(decode_incoming(br#"{"version":1}"#).is_err());
        assert!(decode_incoming(br#"{"version":1,"type":"event"}"#).is_err());
    }
}
