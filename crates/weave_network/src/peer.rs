//! Peer registry: the directory of connected peers and their transports.
//!
//! Each entry pairs a peer's [`PeerInfo`] with the connection handle it was
//! registered on, so the two can never drift apart. All mutation goes
//! through the registry's own lock. Removal is keyed by peer id and,
//! optionally, the connection id the caller observed: a reader that outlived
//! its connection cannot evict the peer's newer connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::transport::{Connection, ConnectionId};

/// Identity, address and liveness of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub peer_name: String,
    /// Address the peer can be dialed on.
    pub ip: String,
    /// The peer's listen port.
    pub port: u16,
    pub online: bool,
    /// Last time we heard from this peer.
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, peer_name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id,
            peer_name: peer_name.into(),
            ip: ip.into(),
            port,
            online: true,
            last_seen: Utc::now(),
        }
    }

    /// `ip:port` form of the peer's listen address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// How long the peer has been silent as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A registered peer and the connection it arrived on.
#[derive(Debug, Clone)]
pub struct PeerEntry<C> {
    pub info: PeerInfo,
    pub conn_id: ConnectionId,
    pub conn: C,
}

/// Concurrent map of peer id to (PeerInfo, connection).
#[derive(Debug)]
pub struct PeerRegistry<C> {
    peers: RwLock<HashMap<PeerId, PeerEntry<C>>>,
}

impl<C: Clone> PeerRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer. A previous entry under the same id is replaced and
    /// returned so the caller can close its connection.
    ///
    /// Fails with [`NetworkError::PeerLimit`] when `max_peers` distinct peers
    /// are already registered.
    pub fn insert(
        &self,
        mut info: PeerInfo,
        conn_id: ConnectionId,
        conn: C,
        max_peers: usize,
    ) -> Result<Option<PeerEntry<C>>, NetworkError> {
        let mut peers = self.peers.write();
        if !peers.contains_key(&info.peer_id) && peers.len() >= max_peers {
            return Err(NetworkError::PeerLimit(max_peers));
        }
        info.online = true;
        info.last_seen = Utc::now();
        let entry = PeerEntry {
            info: info.clone(),
            conn_id,
            conn,
        };
        Ok(peers.insert(info.peer_id, entry))
    }

    /// Remove a peer. With `conn_id` set, the entry is only removed if it is
    /// still bound to that connection. Returns the removed entry; concurrent
    /// callers racing on the same peer see exactly one `Some`.
    pub fn remove(&self, peer_id: &PeerId, conn_id: Option<ConnectionId>) -> Option<PeerEntry<C>> {
        let mut peers = self.peers.write();
        match (peers.get(peer_id), conn_id) {
            (Some(entry), Some(expected)) if entry.conn_id != expected => None,
            (Some(_), _) => peers.remove(peer_id),
            (None, _) => None,
        }
    }

    /// Refresh a peer's last-seen timestamp. Returns false if the peer (on
    /// that connection) is no longer registered.
    pub fn touch(&self, peer_id: &PeerId, conn_id: ConnectionId) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(peer_id) {
            Some(entry) if entry.conn_id == conn_id => {
                entry.info.last_seen = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// The connection currently registered for a peer.
    pub fn connection(&self, peer_id: &PeerId) -> Option<(ConnectionId, C)> {
        self.peers
            .read()
            .get(peer_id)
            .map(|e| (e.conn_id, e.conn.clone()))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).map(|e| e.info.clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Point-in-time copy of every registered peer.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.read().values().map(|e| e.info.clone()).collect()
    }

    /// Point-in-time copy of every registered connection.
    pub fn connections(&self) -> Vec<(PeerId, ConnectionId, C)> {
        self.peers
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.conn_id, e.conn.clone()))
            .collect()
    }

    /// Entries whose connection is closed or whose peer has been silent
    /// longer than `timeout` as of `now`.
    pub fn stale<F>(&self, now: DateTime<Utc>, timeout: Duration, is_closed: F) -> Vec<(PeerId, ConnectionId)>
    where
        F: Fn(&C) -> bool,
    {
        self.peers
            .read()
            .iter()
            .filter(|(_, e)| is_closed(&e.conn) || e.info.idle_for(now) > timeout)
            .map(|(id, e)| (id.clone(), e.conn_id))
            .collect()
    }

    /// Remove every entry at once.
    pub fn drain(&self) -> Vec<PeerEntry<C>> {
        self.peers.write().drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl<C: Clone> Default for PeerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry a running node keeps: peers keyed to live connections.
pub type ConnectionRegistry = PeerRegistry<Arc<Connection>>;

impl PeerRegistry<Arc<Connection>> {
    /// Remove a peer and close its connection. Every removal of a live peer
    /// (end of stream, DISCONNECT, write failure, liveness eviction) goes
    /// through here; racing callers collapse to a single close. Only node
    /// shutdown bypasses it, via [`drain`](Self::drain).
    pub async fn disconnect(&self, peer_id: &PeerId, conn_id: Option<ConnectionId>, reason: &str) -> bool {
        match self.remove(peer_id, conn_id) {
            Some(entry) => {
                info!(
                    "Peer '{}' ({peer_id}) removed: {reason}",
                    entry.info.peer_name
                );
                entry.conn.close().await;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
