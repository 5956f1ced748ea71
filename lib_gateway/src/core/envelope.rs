//! # Wire Types
//!
//! The JSON envelope is the one message shape the gateway speaks, both to
//! browsers and to sibling instances over the cluster bus:
//!
//! ```json
//! {"event": "visitor-online", "payload": {"online": 3}, "room": "public"}
//! ```
//!
//! A missing or empty `room` means "every channel". An envelope carrying a
//! `topic` goes only to public connections joined to that sub-topic, on every
//! instance. Inbound public-channel
//! messages use `{"type": "...", "payload": {...}}`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;

/// # Room
///
/// The coarse channel partition a connection lives in. Sub-topics are a
/// separate, finer grouping inside `Public`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// Anonymous site visitors.
    Public,
    /// Authenticated dashboard sessions.
    Admin,
}

impl Room {
    /// Both rooms, in delivery order.
    pub const ALL: [Room; 2] = [Room::Public, Room::Admin];

    /// The wire name of the room.
    pub fn as_str(&self) -> &'static str {
        match self {
            Room::Public => "public",
            Room::Admin => "admin",
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Room {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Room::Public),
            "admin" => Ok(Room::Admin),
            other => Err(format!("unknown room '{}'", other)),
        }
    }
}

/// `room` on the wire: absent, null and `""` all mean "every channel".
mod target_room {
    use super::*;

    pub fn serialize<S: Serializer>(room: &Option<Room>, s: S) -> Result<S::Ok, S::Error> {
        match room {
            Some(room) => s.serialize_str(room.as_str()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Room>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(name) => name.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

/// # Message Envelope
///
/// The unit of delivery. Serialized once per broadcast and shared between all
/// recipients as an `Arc<str>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `visitor-online`.
    pub event: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Optional status code, used by `AUTH_FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Target room, `None` for every channel.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "target_room"
    )]
    pub room: Option<Room>,
    /// Public sub-topic the envelope is limited to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Envelope {
    /// Creates an envelope addressed to every channel.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            code: None,
            room: None,
            topic: None,
        }
    }

    /// Addresses the envelope to one room (`None` for all).
    pub fn to_room(mut self, room: Option<Room>) -> Self {
        self.room = room;
        self
    }

    /// Limits the envelope to members of a public sub-topic.
    pub fn to_topic(mut self, topic: impl Into<String>) -> Self {
        self.room = Some(Room::Public);
        self.topic = Some(topic.into());
        self
    }

    /// Attaches a status code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Serializes the envelope into a shareable text frame.
    pub fn to_frame(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// A frame queued for one connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized envelope.
    Frame(Arc<str>),
    /// Close the transport after flushing what was queued before it.
    Close,
}

/// The per-connection send half handed to the hub by the transport layer.
pub type ConnectionSender = mpsc::Sender<Outbound>;

/// # Connection Id
///
/// Opaque identifier of one live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    /// Wraps an identifier assigned by the transport.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// # Handshake Metadata
///
/// Query parameters and headers captured when the transport accepted the
/// connection. Key lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl Handshake {
    /// An empty handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Looks up a query parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        lookup(&self.query, key)
    }

    /// Looks up a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        lookup(&self.headers, key)
    }

    /// The client-declared logical session, if any non-blank one was sent.
    pub fn session_id(&self) -> Option<&str> {
        self.query("sessionId")
            .or_else(|| self.header("x-session-id"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The admin credential: `token` query parameter first, then the
    /// `Authorization` header, with an optional `Bearer ` prefix removed.
    pub fn bearer_token(&self) -> Option<&str> {
        let raw = self
            .query("token")
            .or_else(|| self.header("authorization"))?
            .trim();
        let token = match raw.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
            _ => raw,
        };
        (!token.is_empty()).then_some(token)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// # Client Message
///
/// A recognised inbound message. Anything that does not parse into one of
/// these is ignored by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Join a public sub-topic.
    Join(String),
    /// Leave a public sub-topic.
    Leave(String),
    /// Re-bind the connection to another logical session.
    UpdateSession(String),
    /// Attach an identity label to the connection.
    Identify(String),
    /// Start tailing the process log (admin only).
    Log {
        /// Replay segments written since startup first.
        replay_previous: bool,
    },
    /// Stop tailing the process log (admin only).
    Unlog,
}

#[derive(Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ClientMessage {
    /// Parses `{"type": ..., "payload": {...}}`. Returns `None` for anything
    /// malformed, unknown or missing a required field.
    pub fn parse(raw: &str) -> Option<Self> {
        let msg: RawClientMessage = serde_json::from_str(raw).ok()?;
        let text = |key: &str| {
            msg.payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        match msg.kind.as_str() {
            "join" => text("roomName").map(ClientMessage::Join),
            "leave" => text("roomName").map(ClientMessage::Leave),
            "update-session" => text("sessionId").map(ClientMessage::UpdateSession),
            "identify" => text("identity").map(ClientMessage::Identify),
            "log" => Some(ClientMessage::Log {
                replay_previous: msg
                    .payload
                    .get("prevLog")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "unlog" => Some(ClientMessage::Unlog),
            _ => None,
        }
    }
}
