//! Node identity: unique node identification and persistence.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::{read_json, write_json};
use crate::error::NetworkError;

/// A unique identifier for a node on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// A fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an id received from elsewhere (a peer, the command line).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a node presents to its peers.
///
/// The listen port is not part of the persisted identity; it is taken from
/// the bound listener when the node starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique peer identifier.
    pub peer_id: PeerId,
    /// Human-readable display name.
    pub name: String,
}

impl NodeIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::generate(),
            name: name.into(),
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        write_json(path, self)
    }

    /// Load the identity stored at `path`. A missing or unusable file gets a
    /// fresh identity named `name`, which is written back so the id stays
    /// stable across restarts.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        match read_json(path) {
            Ok(Some(identity)) => return identity,
            Ok(None) => {}
            Err(e) => warn!("Replacing identity at {}: {e}", path.display()),
        }

        let identity = Self::generate(name);
        if let Err(e) = identity.save_to_file(path) {
            warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_peer_id_is_a_bare_json_string() {
        let id = PeerId::from_string("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_eq!(format!("{id}"), "abc");
    }

    #[test]
    fn test_identity_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let original = NodeIdentity::generate("persist-test");
        original.save_to_file(&path).unwrap();

        let loaded = NodeIdentity::load_or_generate(&path, "fallback-name");
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_identity_load_missing_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = NodeIdentity::load_or_generate(&path, "new-node");
        assert_eq!(identity.name, "new-node");
        assert!(path.exists());

        let again = NodeIdentity::load_or_generate(&path, "other-name");
        assert_eq!(again.peer_id, identity.peer_id);
    }

    #[test]
    fn test_identity_corrupt_file_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{not json").unwrap();

        let identity = NodeIdentity::load_or_generate(&path, "recovered");
        assert_eq!(identity.name, "recovered");
    }
}
