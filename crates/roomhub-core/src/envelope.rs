//! Wire envelope exchanged over the socket in both directions.
//!
//! ```json
//! { "type": "message", "data": { ... }, "timestamp": "2024-01-01T00:00:00Z" }
//! ```
//!
//! The `data` payload is selected by `type`. Decoding first reads the frame
//! shell, then dispatches on the declared type to the matching payload shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::errors::FrameError;
use crate::ids::{RoomId, UserId};

/// Public identity of a connected user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
}

impl UserSummary {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// `message` payload. Identity fields are optional inbound; the server
/// stamps them from the connection before fan-out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    pub content: String,
    #[serde(default)]
    pub room_id: RoomId,
}

/// `typing` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
}

/// `user_joined` / `user_left` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user: UserSummary,
    pub online_users: Vec<UserSummary>,
}

/// Discriminant of the `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Typing,
    Ping,
    Pong,
    UserJoined,
    UserLeft,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "typing" => Ok(Self::Typing),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "user_joined" => Ok(Self::UserJoined),
            "user_left" => Ok(Self::UserLeft),
            other => Err(FrameError::UnknownType(other.to_owned())),
        }
    }
}

/// One event with its typed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Message(ChatMessage),
    Typing(TypingNotice),
    Ping,
    Pong,
    UserJoined(PresenceUpdate),
    UserLeft(PresenceUpdate),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Typing(_) => EventKind::Typing,
            Self::Ping => EventKind::Ping,
            Self::Pong => EventKind::Pong,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
        }
    }

    fn decode_payload(kind: EventKind, data: Value) -> Result<Self, FrameError> {
        let event = match kind {
            EventKind::Message => Self::Message(payload(kind, data)?),
            EventKind::Typing => {
                // `data` may be omitted entirely for typing notices.
                if data.is_null() {
                    Self::Typing(TypingNotice::default())
                } else {
                    Self::Typing(payload(kind, data)?)
                }
            }
            EventKind::Ping => Self::Ping,
            EventKind::Pong => Self::Pong,
            EventKind::UserJoined => Self::UserJoined(payload(kind, data)?),
            EventKind::UserLeft => Self::UserLeft(payload(kind, data)?),
        };
        Ok(event)
    }
}

fn payload<T: for<'de> Deserialize<'de>>(kind: EventKind, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|e| FrameError::InvalidPayload {
        kind: kind.as_str(),
        reason: e.to_string(),
    })
}

/// A timestamped event as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

/// Frame shell read before the payload is interpreted.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct EmptyPayload {}

impl Envelope {
    /// Wrap an event, stamped with the current time.
    pub fn new(event: Event) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Decode one text frame. A missing timestamp is filled with now.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let kind: EventKind = raw.kind.parse()?;
        let event = Event::decode_payload(kind, raw.data)?;
        Ok(Self {
            event,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
        })
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|e| FrameError::Encode(e.to_string()))
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut frame = serializer.serialize_struct("Envelope", 3)?;
        frame.serialize_field("type", &self.kind())?;
        match &self.event {
            Event::Message(m) => frame.serialize_field("data", m)?,
            Event::Typing(t) => frame.serialize_field("data", t)?,
            Event::Ping | Event::Pong => frame.serialize_field("data", &EmptyPayload {})?,
            Event::UserJoined(p) | Event::UserLeft(p) => frame.serialize_field("data", p)?,
        }
        frame.serialize_field("timestamp", &self.timestamp.to_rfc3339())?;
        frame.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserSummary {
        UserSummary::new(UserId::from_raw("u1"), "alice")
    }

    #[test]
    fn message_serializes_with_type_data_timestamp() {
        let env = Envelope::new(Event::Message(ChatMessage {
            user_id: UserId::from_raw("u1"),
            username: "alice".into(),
            content: "hi".into(),
            room_id: RoomId::from_raw("general"),
        }));
        let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["data"]["content"], "hi");
        assert_eq!(json["data"]["room_id"], "general");
        assert_eq!(json["data"]["user_id"], "u1");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn pong_has_empty_object_payload() {
        let json: Value = serde_json::to_value(Envelope::new(Event::Pong)).unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["data"], serde_json::json!({}));
    }

    #[test]
    fn presence_payload_shape() {
        let env = Envelope::new(Event::UserLeft(PresenceUpdate {
            user: alice(),
            online_users: vec![UserSummary::new(UserId::from_raw("u2"), "bob")],
        }));
        let json: Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "user_left");
        assert_eq!(json["data"]["user"]["username"], "alice");
        assert_eq!(json["data"]["online_users"][0]["id"], "u2");
    }

    #[test]
    fn decode_client_message_without_identity() {
        let env = Envelope::decode(r#"{"type":"message","data":{"content":"hi"}}"#).unwrap();
        match env.event {
            Event::Message(m) => {
                assert_eq!(m.content, "hi");
                assert!(m.user_id.is_blank());
                assert!(m.room_id.is_blank());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_keeps_supplied_timestamp() {
        let env =
            Envelope::decode(r#"{"type":"ping","data":{},"timestamp":"2024-05-01T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(env.event, Event::Ping);
        assert_eq!(env.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn decode_ping_without_data() {
        let env = Envelope::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind(), EventKind::Ping);
    }

    #[test]
    fn decode_typing_without_data() {
        let env = Envelope::decode(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(env.event, Event::Typing(TypingNotice::default()));
    }

    #[test]
    fn decode_unknown_type() {
        let err = Envelope::decode(r#"{"type":"bogus","data":{}}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(ref t) if t == "bogus"));
    }

    #[test]
    fn decode_malformed_json() {
        let err = Envelope::decode("{not json").unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn decode_missing_type_is_malformed() {
        let err = Envelope::decode(r#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn decode_message_without_content_is_invalid_payload() {
        let err = Envelope::decode(r#"{"type":"message","data":{"user_id":"u1"}}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidPayload { kind: "message", .. }));
    }

    #[test]
    fn encoded_presence_decodes_to_same_event() {
        let env = Envelope::new(Event::UserJoined(PresenceUpdate {
            user: alice(),
            online_users: vec![alice()],
        }));
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.event, env.event);
    }

    #[test]
    fn kind_parses_all_wire_names() {
        for kind in [
            EventKind::Message,
            EventKind::Typing,
            EventKind::Ping,
            EventKind::Pong,
            EventKind::UserJoined,
            EventKind::UserLeft,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }
}
