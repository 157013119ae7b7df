//! Wire envelope — one logical request/response unit per text frame.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Direction of an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Client-originated request. Frames without a `type` field decode as
    /// requests.
    #[default]
    Request,
    /// Bridge-originated response (success, stream item, end marker, or
    /// failure).
    Response,
}

/// One envelope on the wire.
///
/// A response carries exactly one of `payload` or `error`; the stream end
/// marker is a response whose payload is `{"end": true}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Request or response.
    #[serde(rename = "type", default)]
    pub kind: EnvelopeKind,
    /// Registered operation name; required on requests, echoed on responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Client-assigned correlation id. Opaque, unique only per session at any
    /// instant; empty is permitted and echoed as-is.
    #[serde(default)]
    pub id: String,
    /// Method-specific body. Absent on failure responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Human-readable failure message; presence marks the envelope failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Malformed outer frame. Connection-fatal at the session layer.
#[derive(Debug, thiserror::Error)]
#[error("malformed envelope: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Decode one text frame into an envelope.
///
/// Method validity is not checked here; that is the dispatcher's concern.
pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    Ok(serde_json::from_str(frame)?)
}

/// Encode an envelope into one text frame.
///
/// Total for well-formed envelopes; a serialization failure (not reachable
/// for JSON-valued payloads) yields an empty frame and an error event.
pub fn encode(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize envelope");
        String::new()
    })
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(method: impl Into<String>, id: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            method: method.into(),
            id: id.into(),
            payload,
            error: None,
        }
    }

    /// Build a success response carrying a payload.
    pub fn response(method: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            method: method.into(),
            id: id.into(),
            payload: Some(payload),
            error: None,
        }
    }

    /// Build a failure response echoing the originating id.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            method: String::new(),
            id: id.into(),
            payload: None,
            error: Some(message.into()),
        }
    }

    /// Build the terminal end-of-stream marker for a streaming call.
    pub fn stream_end(method: impl Into<String>, id: impl Into<String>) -> Self {
        Self::response(method, id, json!({"end": true}))
    }

    /// Whether this envelope reports a failure.
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Whether this envelope is the end-of-stream marker.
    pub fn is_stream_end(&self) -> bool {
        self.payload
            .as_ref()
            .and_then(|p| p.get("end"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── decode ──────────────────────────────────────────────────────

    #[test]
    fn decode_full_request() {
        let env = decode(
            r#"{"type":"request","method":"SayHello","id":"a1","payload":{"name":"World"}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Request);
        assert_eq!(env.method, "SayHello");
        assert_eq!(env.id, "a1");
        assert_eq!(env.payload.unwrap()["name"], "World");
        assert!(env.error.is_none());
    }

    #[test]
    fn decode_defaults_kind_to_request() {
        let env = decode(r#"{"method":"StreamMessages","id":"s1","payload":{"count":3}}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Request);
    }

    #[test]
    fn decode_missing_method_and_id() {
        let env = decode(r"{}").unwrap();
        assert!(env.method.is_empty());
        assert!(env.id.is_empty());
        assert!(env.payload.is_none());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert!(decode(r#"{"type":"notify","id":"x"}"#).is_err());
    }

    #[test]
    fn decode_rejects_non_object() {
        assert!(decode("[1,2,3]").is_err());
        assert!(decode("\"hello\"").is_err());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(decode("not json at all").is_err());
        assert!(decode("").is_err());
        assert!(decode(r#"{"method":"#).is_err());
    }

    #[test]
    fn decode_error_message_mentions_malformed() {
        let err = decode("{").unwrap_err();
        assert!(err.to_string().starts_with("malformed envelope"));
    }

    // ── encode ──────────────────────────────────────────────────────

    #[test]
    fn encode_success_response() {
        let env = Envelope::response("SayHello", "a1", json!({"message": "Hello World"}));
        let v: Value = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["method"], "SayHello");
        assert_eq!(v["id"], "a1");
        assert_eq!(v["payload"]["message"], "Hello World");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn encode_failure_omits_payload_and_method() {
        let env = Envelope::failure("x", "unknown method: Foo");
        let v: Value = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["id"], "x");
        assert_eq!(v["error"], "unknown method: Foo");
        assert!(v.get("payload").is_none());
        assert!(v.get("method").is_none());
    }

    #[test]
    fn encode_always_writes_id_even_when_empty() {
        let env = Envelope::failure("", "backend unavailable");
        let v: Value = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(v["id"], "");
    }

    #[test]
    fn stream_end_marker_payload() {
        let env = Envelope::stream_end("StreamMessages", "s1");
        assert!(env.is_stream_end());
        assert!(!env.is_failure());
        let v: Value = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(v["payload"]["end"], true);
        assert_eq!(v["id"], "s1");
    }

    #[test]
    fn item_payload_is_not_stream_end() {
        let env = Envelope::response("StreamMessages", "s1", json!({"message": "ping", "index": 1}));
        assert!(!env.is_stream_end());
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let env = Envelope::request("SayHello", "req_1", Some(json!({"name": "alice"})));
        let back = decode(&encode(&env)).unwrap();
        assert_eq!(back.kind, env.kind);
        assert_eq!(back.method, env.method);
        assert_eq!(back.id, env.id);
        assert_eq!(back.payload, env.payload);
    }

    #[test]
    fn response_has_exactly_one_of_payload_or_error() {
        let ok = Envelope::response("SayHello", "a", json!({}));
        assert!(ok.payload.is_some() && ok.error.is_none());
        let failed = Envelope::failure("a", "boom");
        assert!(failed.payload.is_none() && failed.error.is_some());
    }

    // ── wire format fixtures ────────────────────────────────────────

    #[test]
    fn wire_format_unary_scenario() {
        let req =
            decode(r#"{"type":"request","method":"SayHello","id":"a1","payload":{"name":"World"}}"#)
                .unwrap();
        assert_eq!(req.method, "SayHello");

        let resp = Envelope::response("SayHello", "a1", json!({"message": "Hello World"}));
        let v: Value = serde_json::from_str(&encode(&resp)).unwrap();
        assert_eq!(
            v,
            serde_json::from_str::<Value>(
                r#"{"type":"response","method":"SayHello","id":"a1","payload":{"message":"Hello World"}}"#
            )
            .unwrap()
        );
    }

    #[test]
    fn wire_format_unknown_method_scenario() {
        let req = decode(r#"{"method":"Foo","id":"x"}"#).unwrap();
        assert_eq!(req.method, "Foo");
        assert_eq!(req.id, "x");

        let resp = Envelope::failure("x", "unknown method: Foo");
        let v: Value = serde_json::from_str(&encode(&resp)).unwrap();
        assert_eq!(
            v,
            serde_json::from_str::<Value>(
                r#"{"type":"response","id":"x","error":"unknown method: Foo"}"#
            )
            .unwrap()
        );
    }
}
