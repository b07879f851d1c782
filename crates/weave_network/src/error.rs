//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::PeerId;

/// Errors that can occur in the weave_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The listening socket could not be bound at start.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Dialing a remote node failed before a handshake could run.
    #[error("Connect error: {0}")]
    Connect(String),

    /// A transport-level error (WebSocket send/receive, closed socket).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side broke the handshake protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The requested peer was not found in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The configured peer limit has been reached.
    #[error("Peer limit of {0} reached")]
    PeerLimit(usize),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// The node was stopped and cannot be restarted.
    #[error("Node has been stopped")]
    Stopped,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error means the connection to the peer is unusable, as
    /// opposed to a local or caller-side problem. Write failures of this
    /// kind drop the peer.
    pub fn is_peer_loss(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_) | Self::Timeout(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
