use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::WsError;

/// Envelope type sent periodically while heartbeats are enabled.
pub const HEARTBEAT_PING: &str = "ping";
/// Envelope type a server answers heartbeats with. Consumed by the manager, never dispatched.
pub const HEARTBEAT_PONG: &str = "pong";

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A unit of application data exchanged over the connection.
///
/// Serialized on the wire as
/// `{ "id": string, "type": string, "payload": <any>, "timestamp": number }`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl Message {
    /// Stamp a request with a fresh identifier and the current time.
    #[must_use]
    pub fn stamp(request: MessageRequest) -> Self {
        Self {
            id: new_id(),
            kind: request.kind,
            payload: request.payload,
            timestamp: now(),
        }
    }

    pub(crate) fn heartbeat() -> Self {
        Self::stamp(MessageRequest::new(HEARTBEAT_PING, Value::Null))
    }

    pub(crate) fn is_pong(&self) -> bool {
        self.kind == HEARTBEAT_PONG
    }
}

/// What callers hand to [`send`](super::ConnectionManager::send): the manager assigns
/// `id` and `timestamp`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRequest {
    pub kind: String,
    pub payload: Value,
}

impl MessageRequest {
    #[must_use]
    pub fn new<K: Into<String>>(kind: K, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Inbound shape: servers may omit the fields the manager would otherwise assign.
#[derive(Deserialize)]
struct RawMessage {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    timestamp: Option<Timestamp>,
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        Self {
            id: raw.id.unwrap_or_else(new_id),
            kind: raw.kind,
            payload: raw.payload,
            timestamp: raw.timestamp.unwrap_or_else(now),
        }
    }
}

/// Parse a text frame into envelopes.
///
/// A frame carries either one envelope or a JSON array of them. Whitespace-only frames
/// (server keepalives) yield nothing.
pub fn parse_messages(bytes: &[u8]) -> Result<Vec<Message>, WsError> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.first() == Some(&b'[') {
        let raw: Vec<RawMessage> = serde_json::from_slice(trimmed).map_err(WsError::MessageParse)?;
        Ok(raw.into_iter().map(Message::from).collect())
    } else {
        let raw: RawMessage = serde_json::from_slice(trimmed).map_err(WsError::MessageParse)?;
        Ok(vec![raw.into()])
    }
}

fn new_id() -> String {
    Uuid::now_v7().to_string()
}

fn now() -> Timestamp {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stamp_populates_every_field() {
        let before = Utc::now().timestamp_millis();
        let message = Message::stamp(MessageRequest::new(
            "material.subscribe",
            json!({ "materialId": "m-42" }),
        ));

        assert!(!message.id.is_empty(), "id is generated");
        assert!(Uuid::parse_str(&message.id).is_ok(), "id is a uuid");
        assert_eq!(message.kind, "material.subscribe");
        assert_eq!(message.payload, json!({ "materialId": "m-42" }));
        assert!(message.timestamp >= before, "timestamp is assigned at send time");
    }

    #[test]
    fn stamped_ids_are_unique() {
        let a = Message::stamp(MessageRequest::new("a", Value::Null));
        let b = Message::stamp(MessageRequest::new("a", Value::Null));

        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serializes_to_wire_shape() {
        let message = Message {
            id: "abc".to_owned(),
            kind: "status".to_owned(),
            payload: json!({ "online": true }),
            timestamp: 1_700_000_000_000,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "abc",
                "type": "status",
                "payload": { "online": true },
                "timestamp": 1_700_000_000_000_i64
            })
        );
    }

    #[test]
    fn parse_single_message() {
        let json = r#"{
            "id": "evt-1",
            "type": "material.updated",
            "payload": { "materialId": "m-1", "status": "approved" },
            "timestamp": 1753314064237
        }"#;

        let msgs = parse_messages(json.as_bytes()).unwrap();
        assert_eq!(msgs.len(), 1);

        let msg = &msgs[0];
        assert_eq!(msg.id, "evt-1");
        assert_eq!(msg.kind, "material.updated");
        assert_eq!(msg.payload["status"], "approved");
        assert_eq!(msg.timestamp, 1_753_314_064_237);
    }

    #[test]
    fn parse_batch() {
        let json = r#"[
            { "id": "1", "type": "a", "payload": 1, "timestamp": 1 },
            { "id": "2", "type": "b", "payload": 2, "timestamp": 2 }
        ]"#;

        let msgs = parse_messages(json.as_bytes()).unwrap();
        let ids: Vec<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn parse_fills_missing_fields() {
        let msgs = parse_messages(br#"{ "type": "search.result" }"#).unwrap();

        let msg = &msgs[0];
        assert!(!msg.id.is_empty(), "missing id is generated");
        assert!(msg.timestamp > 0, "missing timestamp is assigned");
        assert_eq!(msg.payload, Value::Null);
    }

    #[test]
    fn parse_whitespace_is_empty() {
        assert!(parse_messages(b"  \n ").unwrap().is_empty());
        assert!(parse_messages(b"").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_missing_type() {
        let result = parse_messages(br#"{ "payload": {} }"#);

        assert!(
            matches!(result, Err(WsError::MessageParse(_))),
            "type is the one field servers must send"
        );
    }

    #[test]
    fn heartbeat_envelopes() {
        let ping = Message::heartbeat();
        assert_eq!(ping.kind, HEARTBEAT_PING);

        let pong = parse_messages(br#"{ "type": "pong" }"#).unwrap();
        assert!(pong[0].is_pong(), "pong envelopes are recognised");
    }
}
