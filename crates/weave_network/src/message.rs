//! Wire messages: the tagged union exchanged between nodes.
//!
//! Every message travels as one JSON object in one WebSocket text frame:
//!
//! ```json
//! {
//!   "id": "5f0c…",
//!   "sender_id": "a1b2…",
//!   "sender_name": "alice",
//!   "body": { "type": "CHAT_MESSAGE", "payload": "hi" },
//!   "timestamp": "2026-10-18T12:00:00Z"
//! }
//! ```
//!
//! `body.type` names the [`MessageKind`]. A `CONNECT` payload is a
//! [`PeerInfo`]; `DISCONNECT` has none; every other kind carries arbitrary
//! JSON that the node routes without inspecting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NetworkError;
use crate::identity::{NodeIdentity, PeerId};
use crate::peer::PeerInfo;

/// The nine message kinds understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Discover,
    Connect,
    Disconnect,
    ShareHistory,
    ShareBookmark,
    SharePage,
    RequestPage,
    ChatMessage,
    SyncRequest,
}

impl MessageKind {
    /// Every kind, in wire-declaration order.
    pub const ALL: [MessageKind; 9] = [
        Self::Discover,
        Self::Connect,
        Self::Disconnect,
        Self::ShareHistory,
        Self::ShareBookmark,
        Self::SharePage,
        Self::RequestPage,
        Self::ChatMessage,
        Self::SyncRequest,
    ];

    /// The tag used for this kind on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::ShareHistory => "SHARE_HISTORY",
            Self::ShareBookmark => "SHARE_BOOKMARK",
            Self::SharePage => "SHARE_PAGE",
            Self::RequestPage => "REQUEST_PAGE",
            Self::ChatMessage => "CHAT_MESSAGE",
            Self::SyncRequest => "SYNC_REQUEST",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    Discover(Value),
    /// Handshake request, and the acknowledgment sent back by the acceptor.
    Connect(PeerInfo),
    Disconnect,
    ShareHistory(Value),
    ShareBookmark(Value),
    SharePage(Value),
    RequestPage(Value),
    ChatMessage(Value),
    SyncRequest(Value),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Discover(_) => MessageKind::Discover,
            Self::Connect(_) => MessageKind::Connect,
            Self::Disconnect => MessageKind::Disconnect,
            Self::ShareHistory(_) => MessageKind::ShareHistory,
            Self::ShareBookmark(_) => MessageKind::ShareBookmark,
            Self::SharePage(_) => MessageKind::SharePage,
            Self::RequestPage(_) => MessageKind::RequestPage,
            Self::ChatMessage(_) => MessageKind::ChatMessage,
            Self::SyncRequest(_) => MessageKind::SyncRequest,
        }
    }

    /// The opaque application payload, if this is an application body.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Discover(v)
            | Self::ShareHistory(v)
            | Self::ShareBookmark(v)
            | Self::SharePage(v)
            | Self::RequestPage(v)
            | Self::ChatMessage(v)
            | Self::SyncRequest(v) => Some(v),
            Self::Connect(_) | Self::Disconnect => None,
        }
    }
}

/// A routed message: sender identity, body and creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4).
    pub id: String,
    pub sender_id: PeerId,
    pub sender_name: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message from `sender`, stamped now.
    pub fn new(sender: &NodeIdentity, body: MessageBody) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender.peer_id.clone(),
            sender_name: sender.name.clone(),
            body,
            timestamp: Utc::now(),
        }
    }

    /// A CONNECT message carrying `info`.
    pub fn connect(sender: &NodeIdentity, info: PeerInfo) -> Self {
        Self::new(sender, MessageBody::Connect(info))
    }

    pub fn disconnect(sender: &NodeIdentity) -> Self {
        Self::new(sender, MessageBody::Disconnect)
    }

    /// A CHAT_MESSAGE whose payload is the given text.
    pub fn chat(sender: &NodeIdentity, text: impl Into<String>) -> Self {
        Self::new(sender, MessageBody::ChatMessage(Value::String(text.into())))
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// The opaque application payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.body.payload()
    }

    /// Decode the application payload into a collaborator type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        let value = self.payload().cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize the message to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} from {} ({})",
            self.timestamp.to_rfc3339(),
            self.kind(),
            self.sender_name,
            self.sender_id
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
