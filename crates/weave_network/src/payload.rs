//! Payload helpers: typed records for the browser's application messages.
//!
//! The network core treats payloads as opaque JSON. These types give the
//! browser side a typed view, plus builders that produce ready [`Message`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::NodeIdentity;
use crate::message::{Message, MessageBody};

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A page visit shared with peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: String,
    pub title: String,
    pub visited_at: DateTime<Utc>,
    /// The node that made the visit.
    pub peer_id: String,
    pub peer_name: String,
}

impl HistoryEntry {
    /// A visit made just now by `visitor`.
    pub fn now(visitor: &NodeIdentity, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            visited_at: Utc::now(),
            peer_id: visitor.peer_id.to_string(),
            peer_name: visitor.name.clone(),
        }
    }

    pub fn into_message(self, sender: &NodeIdentity) -> Result<Message, NetworkError> {
        Ok(Message::new(sender, MessageBody::ShareHistory(serde_json::to_value(self)?)))
    }
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} visited {} - {}",
            self.visited_at.format("%Y-%m-%d %H:%M:%S"),
            self.peer_name,
            self.title,
            self.url
        )
    }
}

// ---------------------------------------------------------------------------
// Bookmarks and pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub url: String,
    pub title: String,
}

impl Bookmark {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }

    pub fn into_message(self, sender: &NodeIdentity) -> Result<Message, NetworkError> {
        Ok(Message::new(sender, MessageBody::ShareBookmark(serde_json::to_value(self)?)))
    }
}

/// A page pushed to peers ("look at this").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedPage {
    pub url: String,
    pub title: String,
}

impl SharedPage {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }

    pub fn into_message(self, sender: &NodeIdentity) -> Result<Message, NetworkError> {
        Ok(Message::new(sender, MessageBody::SharePage(serde_json::to_value(self)?)))
    }
}

/// Ask a peer to send a page back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub url: String,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn into_message(self, sender: &NodeIdentity) -> Result<Message, NetworkError> {
        Ok(Message::new(sender, MessageBody::RequestPage(serde_json::to_value(self)?)))
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// The text of a CHAT_MESSAGE, or `None` for any other message.
pub fn chat_text(message: &Message) -> Option<&str> {
    match &message.body {
        MessageBody::ChatMessage(value) => value.as_str(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn me() -> NodeIdentity {
        NodeIdentity::generate("alice")
    }

    #[test]
    fn test_history_entry_message() {
        let alice = me();
        let entry = HistoryEntry::now(&alice, "https://example.com", "Example");
        let message = entry.clone().into_message(&alice).unwrap();

        assert_eq!(message.kind(), MessageKind::ShareHistory);
        assert_eq!(message.sender_id, alice.peer_id);

        let wire = message.to_json().unwrap();
        assert!(wire.contains("\"visited_at\""));
        let decoded: HistoryEntry = Message::from_json(&wire).unwrap().payload_as().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.peer_name, "alice");
    }

    #[test]
    fn test_history_entry_display() {
        let entry = HistoryEntry::now(&me(), "https://rust-lang.org", "Rust");
        let shown = entry.to_string();
        assert!(shown.ends_with("alice visited Rust - https://rust-lang.org"));
    }

    #[test]
    fn test_builders_pick_matching_kind() {
        let alice = me();
        let bookmark = Bookmark::new("https://a", "A").into_message(&alice).unwrap();
        let page = SharedPage::new("https://b", "B").into_message(&alice).unwrap();
        let request = PageRequest::new("https://c").into_message(&alice).unwrap();

        assert_eq!(bookmark.kind(), MessageKind::ShareBookmark);
        assert_eq!(page.kind(), MessageKind::SharePage);
        assert_eq!(request.kind(), MessageKind::RequestPage);
        assert_eq!(request.payload_as::<PageRequest>().unwrap().url, "https://c");
    }

    #[test]
    fn test_payload_of_wrong_shape_is_an_error() {
        let alice = me();
        let page = SharedPage::new("https://b", "B").into_message(&alice).unwrap();
        assert!(page.payload_as::<HistoryEntry>().is_err());

        let goodbye = Message::disconnect(&alice);
        assert!(matches!(
            goodbye.payload_as::<Bookmark>(),
            Err(NetworkError::Serialization(_))
        ));
    }

    #[test]
    fn test_chat_text() {
        let alice = me();
        assert_eq!(chat_text(&Message::chat(&alice, "hi")), Some("hi"));
        assert_eq!(chat_text(&Message::disconnect(&alice)), None);
    }
}
