//! WebSocket transport: one socket per peer, split into a write handle and
//! a read stream.
//!
//! Framing is delegated to WebSocket: each [`Message`] is exactly one text
//! frame holding its JSON encoding. The write half lives in a
//! [`Connection`] behind a single async mutex, so concurrent senders never
//! interleave frames. The read half is a [`MessageStream`] owned by exactly
//! one task. Closing a connection wakes that task, which is how a reader
//! blocked on a silent socket gets unstuck.
//!
//! Writes are bounded by the configured write timeout. A peer that stops
//! reading fills the socket buffers; the next write then fails instead of
//! holding the write half forever.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::future::Future;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_async_with_config, client_async_with_config};
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::message::Message;

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Upper bound on flushing a close frame to a peer that stopped reading.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The write side of a peer connection.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    /// `None` once [`close`](Connection::close) has released the socket.
    sink: Mutex<Option<WsSink>>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local end of the socket; its IP is what we advertise by default.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one message. Callers racing on the same connection are
    /// serialized; a message is always written as a whole frame.
    ///
    /// Waiting for the writer and writing the frame together are bounded by
    /// the write timeout, so a peer that stopped reading fails the send
    /// instead of stalling the caller.
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let json = self.encode(message)?;
        self.bounded(async move {
            let mut sink = self.sink.lock().await;
            self.write_frame(&mut sink, json).await
        })
        .await?;
        trace!("Sent {} on {}", message.kind(), self.id);
        Ok(())
    }

    /// Take the write side for a sequence of messages. Other senders wait
    /// until the returned writer is dropped.
    pub async fn writer(&self) -> Result<ConnectionWriter<'_>, NetworkError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let sink = self.bounded(async { Ok(self.sink.lock().await) }).await?;
        Ok(ConnectionWriter { conn: self, sink })
    }

    /// Close the connection and wake its reader. Only the first call does
    /// anything; it returns `true`.
    ///
    /// Pending writes are abandoned and the socket is released even when
    /// the peer never reads the close frame.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        let sink = match tokio::time::timeout(CLOSE_GRACE, self.sink.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                debug!("Writer on {} still busy; leaving the socket to drop", self.id);
                None
            }
        };
        if let Some(mut sink) = sink {
            match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
                Ok(Ok(())) => debug!("Closed {} to {}", self.id, self.remote_addr),
                Ok(Err(e)) => debug!("Close frame to {} failed: {e}", self.remote_addr),
                Err(_) => debug!("Close frame to {} timed out", self.remote_addr),
            }
        }
        true
    }

    fn closed_error(&self) -> NetworkError {
        NetworkError::Transport(format!("{} is closed", self.id))
    }

    fn encode(&self, message: &Message) -> Result<String, NetworkError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(message.to_json()?)
    }

    async fn write_frame(&self, sink: &mut Option<WsSink>, json: String) -> Result<(), NetworkError> {
        let sink = sink.as_mut().ok_or_else(|| self.closed_error())?;
        sink.send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| NetworkError::Transport(format!("Send error on {}: {e}", self.id)))
    }

    /// Run a write step under the write timeout, abandoning it as soon as
    /// the connection is closed.
    async fn bounded<T>(
        &self,
        step: impl Future<Output = Result<T, NetworkError>>,
    ) -> Result<T, NetworkError> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            outcome = tokio::time::timeout(self.write_timeout, step) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    debug!("Write on {} to {} timed out", self.id, self.remote_addr);
                    Err(NetworkError::Transport(format!(
                        "Write on {} timed out after {:?}",
                        self.id, self.write_timeout
                    )))
                }
            },
            _ = closed_signal(&mut closed) => Err(self.closed_error()),
        }
    }
}

/// Exclusive write access to a [`Connection`], from
/// [`Connection::writer`].
pub struct ConnectionWriter<'a> {
    conn: &'a Connection,
    sink: MutexGuard<'a, Option<WsSink>>,
}

impl ConnectionWriter<'_> {
    /// Write one message, bounded like [`Connection::send`].
    pub async fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        let Self { conn, sink } = self;
        let json = conn.encode(message)?;
        conn.bounded(conn.write_frame(sink, json)).await?;
        trace!("Sent {} on {}", message.kind(), conn.id);
        Ok(())
    }
}

/// Resolves once the connection is marked closed.
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// The read side of a peer connection.
pub struct MessageStream {
    conn_id: ConnectionId,
    source: WsSource,
    closed: watch::Receiver<bool>,
}

impl MessageStream {
    /// Decode the next message.
    ///
    /// `Ok(None)` means the stream ended: the peer closed the socket, sent a
    /// close frame, or our own [`Connection`] was closed. Undecodable frames
    /// and socket errors come back as `Err`.
    pub async fn next_message(&mut self) -> Result<Option<Message>, NetworkError> {
        let Self {
            conn_id,
            source,
            closed,
        } = self;

        loop {
            if *closed.borrow() {
                return Ok(None);
            }
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        return Ok(Some(Message::from_json(&text)?));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("{conn_id} reached end of stream");
                        return Ok(None);
                    }
                    Some(Ok(_)) => {} // Ignore binary/ping/pong
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// Like [`next_message`](Self::next_message) but gives up after `limit`.
    pub async fn next_message_within(
        &mut self,
        limit: Duration,
    ) -> Result<Option<Message>, NetworkError> {
        tokio::time::timeout(limit, self.next_message())
            .await
            .map_err(|_| NetworkError::Timeout(limit))?
    }
}

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

fn split(
    ws: WsStream,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    write_timeout: Duration,
) -> (Arc<Connection>, MessageStream) {
    let id = ConnectionId::next();
    let (sink, source) = ws.split();
    let (closed_tx, closed_rx) = watch::channel(false);
    let conn = Connection {
        id,
        remote_addr,
        local_addr,
        sink: Mutex::new(Some(sink)),
        write_timeout,
        closed: closed_tx,
    };
    let stream = MessageStream {
        conn_id: id,
        source,
        closed: closed_rx,
    };
    (Arc::new(conn), stream)
}

/// Bind the listening socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| NetworkError::Bind { addr, source })
}

/// Upgrade an accepted TCP socket to a peer connection.
pub async fn accept(
    stream: TcpStream,
    config: &NetworkConfig,
) -> Result<(Arc<Connection>, MessageStream), NetworkError> {
    let remote_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let _ = stream.set_nodelay(true);
    let ws = accept_async_with_config(stream, Some(ws_config(config.max_message_size))).await?;
    Ok(split(ws, remote_addr, local_addr, config.write_timeout))
}

/// Dial `addr` (`ip:port`) and upgrade to a peer connection, all within
/// the configured connect timeout.
pub async fn dial(
    addr: &str,
    config: &NetworkConfig,
) -> Result<(Arc<Connection>, MessageStream), NetworkError> {
    let connect_timeout = config.connect_timeout;
    let attempt = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::Connect(format!("Connect to {addr} failed: {e}")))?;
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let _ = stream.set_nodelay(true);

        let url = format!("ws://{addr}/");
        let (ws, _) = client_async_with_config(url, stream, Some(ws_config(config.max_message_size)))
            .await
            .map_err(|e| NetworkError::Connect(format!("Upgrade with {addr} failed: {e}")))?;
        Ok::<_, NetworkError>(split(ws, remote_addr, local_addr, config.write_timeout))
    };

    tokio::time::timeout(connect_timeout, attempt)
        .await
        .map_err(|_| NetworkError::Timeout(connect_timeout))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
