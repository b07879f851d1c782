//! WeaveNode: top-level coordinator for the networking layer.
//!
//! [`WeaveNode`] is the primary public API for weave_network. It owns:
//! - the listening socket and accept loop (inbound handshakes)
//! - outbound dialing (initiator handshakes)
//! - the peer registry and one reader loop per connection
//! - the liveness monitor
//! - the listeners that observe every message

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::dispatch::Dispatcher;
use crate::error::NetworkError;
use crate::handshake::{AcceptorHandshake, InitiatorHandshake, RemoteHello};
use crate::identity::{NodeIdentity, PeerId};
use crate::listener::{ListenerSet, MessageListener};
use crate::liveness::LivenessMonitor;
use crate::message::{Message, MessageBody};
use crate::peer::{ConnectionRegistry, PeerInfo};
use crate::transport::{self, Connection, MessageStream};

/// How long `stop()` waits for a background task before aborting it.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A peer-to-peer node.
///
/// Create one per application instance. Call [`start()`](WeaveNode::start)
/// to begin accepting connections; [`stop()`](WeaveNode::stop) is final.
pub struct WeaveNode {
    core: Arc<NodeCore>,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    Stopped,
    Running {
        shutdown_tx: broadcast::Sender<()>,
        tasks: Vec<JoinHandle<()>>,
    },
    Terminated,
}

/// State shared between the facade and its background tasks.
struct NodeCore {
    identity: NodeIdentity,
    config: NetworkConfig,
    registry: Arc<ConnectionRegistry>,
    listeners: Arc<ListenerSet>,
    dispatcher: Dispatcher,
    running: AtomicBool,
    listen_port: AtomicU16,
    local_addr: parking_lot::RwLock<Option<SocketAddr>>,
}

impl WeaveNode {
    /// Create a new node with the given identity and config.
    pub fn new(identity: NodeIdentity, config: NetworkConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let listeners = Arc::new(ListenerSet::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&listeners));
        let listen_port = config.listen_addr.port();

        Self {
            core: Arc::new(NodeCore {
                identity,
                config,
                registry,
                listeners,
                dispatcher,
                running: AtomicBool::new(false),
                listen_port: AtomicU16::new(listen_port),
                local_addr: parking_lot::RwLock::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Create a node with a fresh identity and default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(NodeIdentity::generate(name), NetworkConfig::default())
    }

    pub fn node_id(&self) -> &PeerId {
        &self.core.identity.peer_id
    }

    pub fn node_name(&self) -> &str {
        &self.core.identity.name
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.core.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.core.config
    }

    /// Whether the node is currently running.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.read()
    }

    /// Point-in-time snapshot of the connected peers.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.core.registry.snapshot()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.core.registry.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Register a listener for every post-handshake message, including
    /// CONNECT and DISCONNECT membership notifications.
    pub fn add_message_listener(&self, listener: MessageListener) {
        self.core.listeners.add(listener);
    }

    /// Build a message from this node.
    pub fn message(&self, body: MessageBody) -> Message {
        Message::new(&self.core.identity, body)
    }

    /// Start the node: bind the listener, then launch the accept loop and
    /// the liveness monitor. Starting a running node is a no-op.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Terminated => return Err(NetworkError::Stopped),
            Lifecycle::Stopped => {}
        }

        let listener = transport::bind(self.core.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        self.core.listen_port.store(local_addr.port(), Ordering::SeqCst);
        *self.core.local_addr.write() = Some(local_addr);
        self.core.running.store(true, Ordering::SeqCst);

        let (shutdown_tx, _) = broadcast::channel(8);

        let accept_core = Arc::clone(&self.core);
        let accept_shutdown = shutdown_tx.subscribe();
        let accept_task = tokio::spawn(async move {
            accept_core.accept_loop(listener, accept_shutdown).await;
        });

        let liveness_task = LivenessMonitor::new(
            Arc::clone(&self.core.registry),
            self.core.config.liveness_interval,
            self.core.config.peer_timeout,
        )
        .spawn(shutdown_tx.subscribe());

        // Bootstrap peers are dialed in the background; failures are logged.
        for addr in &self.core.config.known_peers {
            let core = Arc::clone(&self.core);
            let addr = addr.clone();
            tokio::spawn(async move {
                match core.connect(&addr).await {
                    Ok(peer) => info!("Connected to bootstrap peer '{}' at {addr}", peer.peer_name),
                    Err(e) => warn!("Failed to connect to bootstrap peer {addr}: {e}"),
                }
            });
        }

        *lifecycle = Lifecycle::Running {
            shutdown_tx,
            tasks: vec![accept_task, liveness_task],
        };
        info!(
            "WeaveNode '{}' started on {local_addr} (peer_id: {})",
            self.core.identity.name, self.core.identity.peer_id
        );
        Ok(())
    }

    /// Stop the node: tell every peer we are leaving, close every
    /// connection and shut down background tasks. The node cannot be
    /// restarted afterwards; stopping twice is a no-op.
    ///
    /// Each goodbye is bounded by the write timeout, so a peer that stopped
    /// reading cannot hold up shutdown.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let (shutdown_tx, tasks) = match std::mem::replace(&mut *lifecycle, Lifecycle::Terminated) {
            Lifecycle::Running { shutdown_tx, tasks } => (shutdown_tx, tasks),
            Lifecycle::Stopped => {
                *lifecycle = Lifecycle::Stopped;
                return;
            }
            Lifecycle::Terminated => return,
        };

        self.core.running.store(false, Ordering::SeqCst);
        let _ = shutdown_tx.send(());

        let goodbye = Message::disconnect(&self.core.identity);
        let entries = self.core.registry.drain();
        let sends = entries.iter().map(|entry| {
            let goodbye = &goodbye;
            async move {
                if let Err(e) = entry.conn.send(goodbye).await {
                    debug!("DISCONNECT to {} failed: {e}", entry.info.peer_id);
                }
                entry.conn.close().await;
            }
        });
        join_all(sends).await;

        for mut task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!(
            "WeaveNode '{}' stopped ({} peers disconnected)",
            self.core.identity.name,
            entries.len()
        );
    }

    /// Dial `addr` (`ip:port`), run the handshake and register the peer.
    pub async fn connect(&self, addr: &str) -> Result<PeerInfo, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        self.core.connect(addr).await
    }

    /// Connect to a peer by IP and port. Returns whether the peer is now
    /// registered; failures are logged, never retried.
    pub async fn connect_to_peer(&self, ip: &str, port: u16) -> bool {
        let addr = if ip.contains(':') && !ip.starts_with('[') {
            format!("[{ip}]:{port}")
        } else {
            format!("{ip}:{port}")
        };

        match self.connect(&addr).await {
            Ok(peer) => {
                info!("Connected to peer '{}' ({}) at {addr}", peer.peer_name, peer.peer_id);
                true
            }
            Err(e) => {
                warn!("Failed to connect to {addr}: {e}");
                false
            }
        }
    }

    /// Send a message to one peer. `Ok(false)` means the write failed and the
    /// peer has been dropped.
    pub async fn send_to_peer(&self, peer_id: &PeerId, message: &Message) -> Result<bool, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let (conn_id, conn) = self
            .core
            .registry
            .connection(peer_id)
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.clone()))?;

        match conn.send(message).await {
            Ok(()) => {
                debug!("Sent {} to {peer_id}", message.kind());
                Ok(true)
            }
            Err(e) if e.is_peer_loss() => {
                warn!("Send to {peer_id} failed: {e}");
                self.core
                    .registry
                    .disconnect(peer_id, Some(conn_id), "write failed")
                    .await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a message to every connected peer. Returns the number of peers
    /// it reached; peers whose write fails are dropped without affecting
    /// delivery to the rest.
    pub async fn broadcast(&self, message: &Message) -> Result<usize, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }

        let targets = self.core.registry.connections();
        debug!("Broadcasting {} to {} peers", message.kind(), targets.len());

        let sends = targets.into_iter().map(|(peer_id, conn_id, conn)| {
            let registry = Arc::clone(&self.core.registry);
            async move {
                match conn.send(message).await {
                    Ok(()) => true,
                    Err(e) if e.is_peer_loss() => {
                        warn!("Broadcast send to {peer_id} failed: {e}");
                        registry.disconnect(&peer_id, Some(conn_id), "write failed").await;
                        false
                    }
                    Err(e) => {
                        warn!("Broadcast of {} to {peer_id} skipped: {e}", message.kind());
                        false
                    }
                }
            }
        });

        let sent = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        Ok(sent)
    }

    /// Tell one peer we are dropping it, then remove it.
    pub async fn disconnect_peer(&self, peer_id: &PeerId) -> Result<(), NetworkError> {
        let (conn_id, conn) = self
            .core
            .registry
            .connection(peer_id)
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.clone()))?;
        if let Err(e) = conn.send(&Message::disconnect(&self.core.identity)).await {
            debug!("DISCONNECT to {peer_id} failed: {e}");
        }
        self.core
            .registry
            .disconnect(peer_id, Some(conn_id), "disconnected locally")
            .await;
        Ok(())
    }
}

impl NodeCore {
    /// Our PeerInfo as seen through `conn`.
    fn own_info(&self, conn: &Connection) -> PeerInfo {
        let ip = self
            .config
            .advertise_ip
            .unwrap_or_else(|| conn.local_addr().ip());
        PeerInfo::new(
            self.identity.peer_id.clone(),
            self.identity.name.clone(),
            ip.to_string(),
            self.listen_port.load(Ordering::SeqCst),
        )
    }

    /// Register a peer whose handshake succeeded. A previous connection for
    /// the same peer is closed. Registration after `stop()` is undone.
    async fn register(&self, info: PeerInfo, conn: &Arc<Connection>) -> Result<(), NetworkError> {
        let peer_id = info.peer_id.clone();
        let replaced = self
            .registry
            .insert(info, conn.id(), Arc::clone(conn), self.config.max_peers)?;

        if let Some(old) = replaced {
            info!("Peer {peer_id} reconnected; closing {}", old.conn_id);
            old.conn.close().await;
        }

        if !self.running.load(Ordering::SeqCst) {
            self.registry
                .disconnect(&peer_id, Some(conn.id()), "node stopping")
                .await;
            return Err(NetworkError::NotRunning);
        }
        Ok(())
    }

    async fn connect(&self, addr: &str) -> Result<PeerInfo, NetworkError> {
        let (conn, mut stream) = transport::dial(addr, &self.config).await?;

        let hello = Message::connect(&self.identity, self.own_info(&conn));
        let mut handshake = InitiatorHandshake::new(conn.remote_addr());
        let remote = match handshake
            .run(&conn, &mut stream, &hello, self.config.handshake_timeout)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        let RemoteHello { info, message } = remote;
        if let Err(e) = self.register(info.clone(), &conn).await {
            conn.close().await;
            return Err(e);
        }
        self.listeners.notify(&message);
        self.dispatcher.spawn(info.peer_id.clone(), conn, stream);
        Ok(info)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {peer_addr}");
                            let core = Arc::clone(&self);
                            tokio::spawn(async move {
                                core.handle_inbound(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("TCP accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Accept loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_inbound(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let upgraded = tokio::time::timeout(
            self.config.handshake_timeout,
            transport::accept(stream, &self.config),
        )
        .await;
        let (conn, stream) = match upgraded {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("WebSocket accept failed for {peer_addr}: {e}");
                return;
            }
            Err(_) => {
                warn!("WebSocket accept timed out for {peer_addr}");
                return;
            }
        };

        if let Err(e) = self.complete_inbound(&conn, stream).await {
            warn!("Rejected connection from {peer_addr}: {e}");
            conn.close().await;
        }
    }

    async fn complete_inbound(&self, conn: &Arc<Connection>, mut stream: MessageStream) -> Result<(), NetworkError> {
        let mut handshake = AcceptorHandshake::new(conn.remote_addr());
        let RemoteHello { info, message } = handshake
            .receive_connect(&mut stream, &self.identity.peer_id, self.config.handshake_timeout)
            .await?;

        let peer_id = info.peer_id.clone();
        // Once registered the peer is a broadcast target; nothing may be
        // written ahead of the acknowledgment.
        let mut writer = conn.writer().await?;
        if let Err(e) = self.register(info.clone(), conn).await {
            handshake.reject(&e);
            return Err(e);
        }
        info!("Peer '{}' ({peer_id}) connected from {}", info.peer_name, conn.remote_addr());
        self.listeners.notify(&message);

        let ack = Message::connect(&self.identity, self.own_info(conn));
        let acknowledged = handshake.acknowledge(&mut writer, &ack).await;
        drop(writer);
        if let Err(e) = acknowledged {
            self.registry
                .disconnect(&peer_id, Some(conn.id()), "acknowledgment failed")
                .await;
            return Err(e);
        }

        self.dispatcher.spawn(peer_id, Arc::clone(conn), stream);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
