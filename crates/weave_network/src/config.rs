//! Network configuration for a Weave node.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NetworkError;

/// Configuration for the Weave networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming peer connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// IP placed in our own PeerInfo during the handshake. When unset, the
    /// local address of the connected socket is used.
    pub advertise_ip: Option<IpAddr>,

    /// Upper bound on dialing a remote node (TCP connect + WebSocket upgrade).
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// How long either side waits for the single handshake message.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Period of the liveness monitor.
    #[serde(with = "duration_serde")]
    pub liveness_interval: Duration,

    /// Upper bound on writing one message to a peer, including the wait
    /// behind other writers. A peer that stops reading is dropped once a
    /// write exceeds it.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// A peer silent for longer than this is evicted.
    #[serde(with = "duration_serde")]
    pub peer_timeout: Duration,

    /// Maximum number of simultaneously registered peers.
    pub max_peers: usize,

    /// Largest message (in bytes) a reader will accept.
    pub max_message_size: usize,

    /// Peers (`ip:port`) dialed once when the node starts.
    pub known_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            advertise_ip: None,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(60),
            max_peers: 32,
            max_message_size: 1024 * 1024,
            known_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Loopback config on an ephemeral port.
    pub fn local() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        write_json(path, self)
    }

    /// Load the config, falling back to defaults when the file is missing
    /// or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        match read_json(path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("Ignoring config at {}: {e}", path.display());
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), NetworkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, NetworkError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&data)?))
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

pub(crate) mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
