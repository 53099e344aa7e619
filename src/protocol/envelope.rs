//! Wire envelopes exchanged with WebSocket clients

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::error::{ClientError, ErrorKind};
use super::event::Event;

/// Status value carried by successful responses
pub const STATUS_OK: &str = "OK";

/// Inbound request: `{action, seq, data}`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub seq: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
}

/// `"data": null` is the same as no payload
fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Request {
    /// Reject requests that must never reach a handler
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.seq <= 0 {
            return Err(ClientError::new(
                ErrorKind::BadSeq,
                "seq must be a positive integer",
            ));
        }
        if self.action.is_empty() {
            return Err(ClientError::new(ErrorKind::BadAction, "action is required"));
        }
        Ok(())
    }
}

/// Successful reply to a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: &'static str,
    pub seq: i64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Response {
    pub fn ok(seq: i64, data: Value) -> Self {
        Self {
            status: STATUS_OK,
            seq,
            data,
        }
    }
}

/// Body of an error reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error reply; `seq` is 0 when the error is not tied to a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub seq: i64,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    /// Build the wire form of an error, dropping internal detail
    pub fn new(seq: i64, err: &ClientError) -> Self {
        Self {
            seq,
            error: ErrorBody {
                kind: err.kind,
                message: err.message.clone(),
            },
        }
    }
}

/// Per-connection rendering of a shared [`Event`].
///
/// Borrows the event so rendering never touches the shared instance;
/// the broadcast directive is not part of the wire form.
#[derive(Debug, Serialize)]
pub struct EventEnvelope<'a> {
    pub seq: i64,
    pub event: &'a str,
    pub data: &'a Map<String, Value>,
}

impl<'a> EventEnvelope<'a> {
    pub fn render(event: &'a Event, seq: i64) -> Self {
        Self {
            seq,
            event: event.kind(),
            data: event.data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::protocol::Broadcast;

    #[test]
    fn test_request_defaults() {
        let req: Request = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(req.action, "ping");
        assert_eq!(req.seq, 0);
        assert!(req.data.is_empty());

        let req: Request = serde_json::from_str(r#"{"action":"ping","seq":2,"data":null}"#).unwrap();
        assert_eq!(req.seq, 2);
        assert!(req.data.is_empty());
    }

    #[test_case(r#"{"action":"ping","seq":1}"#, None ; "valid")]
    #[test_case(r#"{"action":"ping","seq":1,"data":null}"#, None ; "null data")]
    #[test_case(r#"{"action":"ping","seq":0}"#, Some(ErrorKind::BadSeq) ; "zero seq")]
    #[test_case(r#"{"action":"ping","seq":-4}"#, Some(ErrorKind::BadSeq) ; "negative seq")]
    #[test_case(r#"{"action":"","seq":3}"#, Some(ErrorKind::BadAction) ; "empty action")]
    #[test_case(r#"{"seq":3}"#, Some(ErrorKind::BadAction) ; "missing action")]
    fn test_request_validate(raw: &str, expected: Option<ErrorKind>) {
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.validate().err().map(|e| e.kind), expected);
    }

    #[test]
    fn test_response_json() {
        let resp = Response::ok(7, json!({"text": "pong"}));
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"status": "OK", "seq": 7, "data": {"text": "pong"}})
        );

        let resp = Response::ok(8, Value::Null);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"status": "OK", "seq": 8})
        );
    }

    #[test]
    fn test_error_envelope_strips_detail() {
        let err = ClientError::internal("sql: connection refused on 10.0.0.4");
        let envelope = ErrorEnvelope::new(5, &err);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            json,
            json!({"seq": 5, "error": {"kind": "internal", "message": "internal server error"}})
        );
        assert!(!json.to_string().contains("10.0.0.4"));
    }

    #[test]
    fn test_event_envelope_omits_broadcast() {
        let event = Event::new("posted", Broadcast::Team("t1".to_string())).with("post_id", "p1");
        let json = serde_json::to_value(EventEnvelope::render(&event, 3)).unwrap();

        assert_eq!(
            json,
            json!({"seq": 3, "event": "posted", "data": {"post_id": "p1"}})
        );
    }
}
