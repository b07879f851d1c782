//! Handshake: the CONNECT exchange that establishes mutual identity.
//!
//! Initiator: `Init → SentConnect → WaitAck → Established`.
//! Acceptor: `Init → WaitConnect → SentAck → Established`.
//!
//! Each side expects exactly one message from the other, and it must be a
//! CONNECT carrying the sender's [`PeerInfo`]. The acceptor's CONNECT doubles
//! as the acknowledgment. Anything else ends the handshake in `Failed` (I/O,
//! decode, timeout) or `Rejected` (protocol violation) and the caller closes
//! the socket without registering anything.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{Message, MessageBody};
use crate::peer::PeerInfo;
use crate::transport::{Connection, ConnectionWriter, MessageStream};

/// Handshake progress, for both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentConnect,
    WaitAck,
    WaitConnect,
    SentAck,
    Established,
    Failed,
    Rejected,
}

/// The result of a completed handshake step that received the remote's
/// CONNECT: its PeerInfo (address normalized) and the message itself.
#[derive(Debug, Clone)]
pub struct RemoteHello {
    pub info: PeerInfo,
    pub message: Message,
}

/// Dialing side of the handshake.
#[derive(Debug)]
pub struct InitiatorHandshake {
    state: HandshakeState,
    remote_addr: SocketAddr,
}

impl InitiatorHandshake {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            state: HandshakeState::Init,
            remote_addr,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Send our CONNECT and wait for the acceptor's CONNECT.
    pub async fn run(
        &mut self,
        conn: &Connection,
        stream: &mut MessageStream,
        hello: &Message,
        timeout: Duration,
    ) -> Result<RemoteHello, NetworkError> {
        let result = self.exchange(conn, stream, hello, timeout).await;
        self.finish(&result);
        result
    }

    async fn exchange(
        &mut self,
        conn: &Connection,
        stream: &mut MessageStream,
        hello: &Message,
        timeout: Duration,
    ) -> Result<RemoteHello, NetworkError> {
        conn.send(hello).await?;
        self.advance(HandshakeState::SentConnect);

        self.advance(HandshakeState::WaitAck);
        let reply = receive_one(stream, timeout).await?;
        expect_connect(reply, &hello.sender_id, self.remote_addr)
    }

    fn advance(&mut self, next: HandshakeState) {
        trace!("Initiator handshake with {}: {:?} -> {next:?}", self.remote_addr, self.state);
        self.state = next;
    }

    fn finish(&mut self, result: &Result<RemoteHello, NetworkError>) {
        let next = terminal_state(result);
        if let Err(e) = result {
            debug!("Handshake with {} failed: {e}", self.remote_addr);
        }
        self.advance(next);
    }
}

/// Accepting side of the handshake. Split in two steps so the node can
/// register the peer between receiving its CONNECT and acknowledging it.
#[derive(Debug)]
pub struct AcceptorHandshake {
    state: HandshakeState,
    remote_addr: SocketAddr,
}

impl AcceptorHandshake {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            state: HandshakeState::Init,
            remote_addr,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Wait for the initiator's CONNECT.
    pub async fn receive_connect(
        &mut self,
        stream: &mut MessageStream,
        local_id: &PeerId,
        timeout: Duration,
    ) -> Result<RemoteHello, NetworkError> {
        self.advance(HandshakeState::WaitConnect);
        let result = match receive_one(stream, timeout).await {
            Ok(message) => expect_connect(message, local_id, self.remote_addr),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.finish(&result);
        }
        result
    }

    /// Reject an otherwise valid CONNECT (e.g. the peer limit is reached).
    pub fn reject(&mut self, reason: &NetworkError) {
        debug!("Rejecting {}: {reason}", self.remote_addr);
        self.advance(HandshakeState::Rejected);
    }

    /// Send our CONNECT back as the acknowledgment. The writer is taken
    /// before the peer becomes visible, so the acknowledgment is the first
    /// frame the initiator sees.
    pub async fn acknowledge(
        &mut self,
        writer: &mut ConnectionWriter<'_>,
        ack: &Message,
    ) -> Result<(), NetworkError> {
        let result = writer.send(ack).await;
        if result.is_ok() {
            self.advance(HandshakeState::SentAck);
        }
        self.finish(&result);
        result
    }

    fn advance(&mut self, next: HandshakeState) {
        trace!("Acceptor handshake with {}: {:?} -> {next:?}", self.remote_addr, self.state);
        self.state = next;
    }

    fn finish<T>(&mut self, result: &Result<T, NetworkError>) {
        if let Err(e) = result {
            debug!("Handshake from {} failed: {e}", self.remote_addr);
        }
        self.advance(terminal_state(result));
    }
}

fn terminal_state<T>(result: &Result<T, NetworkError>) -> HandshakeState {
    match result {
        Ok(_) => HandshakeState::Established,
        Err(NetworkError::ProtocolViolation(_)) => HandshakeState::Rejected,
        Err(_) => HandshakeState::Failed,
    }
}

/// Wait for exactly one message; end of stream counts as failure.
async fn receive_one(stream: &mut MessageStream, timeout: Duration) -> Result<Message, NetworkError> {
    stream
        .next_message_within(timeout)
        .await?
        .ok_or_else(|| NetworkError::Transport("Stream closed during handshake".to_string()))
}

/// Check that `message` is a well-formed CONNECT from someone other than us.
fn expect_connect(
    message: Message,
    local_id: &PeerId,
    observed: SocketAddr,
) -> Result<RemoteHello, NetworkError> {
    let mut info = match &message.body {
        MessageBody::Connect(info) => info.clone(),
        other => {
            return Err(NetworkError::ProtocolViolation(format!(
                "expected CONNECT, got {}",
                other.kind()
            )));
        }
    };

    if info.peer_id != message.sender_id {
        return Err(NetworkError::ProtocolViolation(format!(
            "CONNECT sender {} does not match PeerInfo {}",
            message.sender_id, info.peer_id
        )));
    }
    if &info.peer_id == local_id {
        return Err(NetworkError::ProtocolViolation(
            "refusing to connect to self".to_string(),
        ));
    }

    // A peer bound to a wildcard address cannot be dialed back on it.
    let advertised = info.ip.parse::<std::net::IpAddr>();
    if info.ip.is_empty() || advertised.is_ok_and(|ip| ip.is_unspecified()) {
        info.ip = observed.ip().to_string();
    }

    Ok(RemoteHello { info, message })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
