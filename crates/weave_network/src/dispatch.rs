//! Reader loop: one task per established connection.
//!
//! The reader is the only consumer of a connection's [`MessageStream`]. It
//! refreshes the peer's last-seen time on every message, hands the message
//! to the node's listeners inline, and tears the peer down on end of stream,
//! decode error or DISCONNECT.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::identity::PeerId;
use crate::listener::ListenerSet;
use crate::message::{Message, MessageBody};
use crate::peer::ConnectionRegistry;
use crate::transport::{Connection, MessageStream};

/// Why a reader loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The socket closed or our side closed the connection.
    EndOfStream,
    /// The peer announced it is leaving.
    Disconnected,
    /// A read or decode error.
    Failed(String),
}

/// Spawns and runs reader loops against a registry and listener set.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    listeners: Arc<ListenerSet>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, listeners: Arc<ListenerSet>) -> Self {
        Self {
            registry,
            listeners,
        }
    }

    /// Start the reader loop for a registered peer.
    pub fn spawn(
        &self,
        peer_id: PeerId,
        conn: Arc<Connection>,
        stream: MessageStream,
    ) -> JoinHandle<ReaderExit> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(peer_id, conn, stream).await })
    }

    /// Drive the loop until the connection ends.
    pub async fn run(&self, peer_id: PeerId, conn: Arc<Connection>, mut stream: MessageStream) -> ReaderExit {
        debug!("Reader for {peer_id} started on {}", conn.id());

        let exit = loop {
            let message = match stream.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => break ReaderExit::EndOfStream,
                Err(e) => break ReaderExit::Failed(e.to_string()),
            };

            match &message.body {
                MessageBody::Disconnect => {
                    self.registry
                        .disconnect(&peer_id, Some(conn.id()), "peer sent DISCONNECT")
                        .await;
                    self.listeners.notify(&message);
                    break ReaderExit::Disconnected;
                }
                MessageBody::Connect(_) => {
                    debug!("Ignoring repeated CONNECT from {peer_id}");
                    self.deliver(&peer_id, &conn, &message);
                }
                MessageBody::Discover(_)
                | MessageBody::ShareHistory(_)
                | MessageBody::ShareBookmark(_)
                | MessageBody::SharePage(_)
                | MessageBody::RequestPage(_)
                | MessageBody::ChatMessage(_)
                | MessageBody::SyncRequest(_) => {
                    self.deliver(&peer_id, &conn, &message);
                }
            }
        };

        let reason = match &exit {
            ReaderExit::EndOfStream => Some("end of stream".to_string()),
            ReaderExit::Failed(e) => Some(format!("read failed: {e}")),
            ReaderExit::Disconnected => None,
        };
        if let Some(reason) = reason {
            self.registry.disconnect(&peer_id, Some(conn.id()), &reason).await;
        }

        debug!("Reader for {peer_id} on {} exited: {exit:?}", conn.id());
        exit
    }

    fn deliver(&self, peer_id: &PeerId, conn: &Connection, message: &Message) {
        self.registry.touch(peer_id, conn.id());
        debug!("Received {} from {peer_id}", message.kind());
        self.listeners.notify(message);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::identity::NodeIdentity;
    use crate::listener::listener;
    use crate::message::MessageKind;
    use crate::peer::PeerInfo;
    use crate::transport::{accept, bind, dial};
    use parking_lot::Mutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        remote: Arc<Connection>,
        remote_identity: NodeIdentity,
        registry: Arc<ConnectionRegistry>,
        received: Arc<Mutex<Vec<Message>>>,
        reader: JoinHandle<ReaderExit>,
        local: Arc<Connection>,
        _remote_rx: MessageStream,
    }

    /// A registered peer whose reader loop is running on our side.
    async fn fixture() -> Fixture {
        let listener_sock = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener_sock.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener_sock.accept().await.unwrap();
            accept(stream, &NetworkConfig::local()).await.unwrap()
        });
        let (remote, remote_rx) = dial(&addr.to_string(), &NetworkConfig::local()).await.unwrap();
        let (local, local_rx) = server.await.unwrap();

        let remote_identity = NodeIdentity::generate("remote");
        let registry = Arc::new(ConnectionRegistry::new());
        let info = PeerInfo::new(remote_identity.peer_id.clone(), "remote", "127.0.0.1", 1);
        registry
            .insert(info, local.id(), Arc::clone(&local), 8)
            .unwrap();

        let listeners = Arc::new(ListenerSet::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        listeners.add(listener(move |m| {
            sink.lock().push(m.clone());
            Ok(())
        }));
        listeners.add(listener(|_| anyhow::bail!("always fails")));

        let dispatcher = Dispatcher::new(Arc::clone(&registry), listeners);
        let reader = dispatcher.spawn(remote_identity.peer_id.clone(), Arc::clone(&local), local_rx);

        Fixture {
            remote,
            remote_identity,
            registry,
            received,
            reader,
            local,
            _remote_rx: remote_rx,
        }
    }

    #[tokio::test]
    async fn test_messages_reach_listeners_despite_failing_listener() {
        let f = fixture().await;
        f.remote.send(&Message::chat(&f.remote_identity, "one")).await.unwrap();
        f.remote.send(&Message::chat(&f.remote_identity, "two")).await.unwrap();

        tokio::time::timeout(WAIT, async {
            while f.received.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let received = f.received.lock().clone();
        assert_eq!(received[0].payload(), Some(&serde_json::json!("one")));
        assert_eq!(received[1].payload(), Some(&serde_json::json!("two")));
        assert!(f.registry.contains(&f.remote_identity.peer_id));
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_and_notifies() {
        let f = fixture().await;
        f.remote.send(&Message::disconnect(&f.remote_identity)).await.unwrap();

        let exit = tokio::time::timeout(WAIT, f.reader).await.unwrap().unwrap();
        assert_eq!(exit, ReaderExit::Disconnected);
        assert!(f.registry.is_empty());
        assert!(f.local.is_closed());

        let received = f.received.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind(), MessageKind::Disconnect);
    }

    #[tokio::test]
    async fn test_remote_close_is_end_of_stream() {
        let f = fixture().await;
        f.remote.close().await;

        let exit = tokio::time::timeout(WAIT, f.reader).await.unwrap().unwrap();
        assert_eq!(exit, ReaderExit::EndOfStream);
        assert!(f.registry.is_empty());
        assert!(f.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_unblocks_reader() {
        let f = fixture().await;
        f.local.close().await;

        let exit = tokio::time::timeout(WAIT, f.reader).await.unwrap().unwrap();
        assert_eq!(exit, ReaderExit::EndOfStream);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_traffic_refreshes_last_seen() {
        let f = fixture().await;
        let before = f.registry.get(&f.remote_identity.peer_id).unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.remote.send(&Message::chat(&f.remote_identity, "tick")).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while f.received.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let after = f.registry.get(&f.remote_identity.peer_id).unwrap().last_seen;
        assert!(after > before);
    }
}
