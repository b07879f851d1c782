//! Weave Network: peer-to-peer messaging for the Weave browser.
//!
//! Every node is both a server and a client: it listens for peers, dials
//! peers it is told about, and exchanges typed messages with everyone it is
//! connected to. Browsers use it to share history, bookmarks and pages, and
//! to chat.
//!
//! # Architecture
//!
//! - **Transport**: one WebSocket (via `tokio-tungstenite`) per peer, one JSON
//!   text frame per message.
//! - **Handshake**: each side sends a CONNECT carrying its `PeerInfo`; the
//!   acceptor's CONNECT is the acknowledgment.
//! - **Dispatch**: one reader task per peer delivers messages to listeners.
//! - **Liveness**: peers silent past the timeout are evicted.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use weave_network::{Message, NetworkConfig, WeaveNode, listener};
//! use weave_network::identity::NodeIdentity;
//!
//! # async fn example() -> Result<(), weave_network::NetworkError> {
//! let node = WeaveNode::new(NodeIdentity::generate("my-node"), NetworkConfig::default());
//! node.add_message_listener(listener(|message| {
//!     println!("{message}");
//!     Ok(())
//! }));
//!
//! node.start().await?;
//! node.connect_to_peer("192.168.1.20", 9001).await;
//! node.broadcast(&Message::chat(node.identity(), "hello")).await?;
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod listener;
pub mod liveness;
pub mod message;
pub mod node;
pub mod payload;
pub mod peer;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use error::NetworkError;
pub use identity::{NodeIdentity, PeerId};
pub use listener::{MessageListener, listener, on_kind};
pub use message::{Message, MessageBody, MessageKind};
pub use node::WeaveNode;
pub use payload::{Bookmark, HistoryEntry, PageRequest, SharedPage};
pub use peer::PeerInfo;
