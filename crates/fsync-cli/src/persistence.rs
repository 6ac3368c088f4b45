//! Persistence for registered peers.
//!
//! Peers are stored as a flat JSON array of `{"IP": ..., "Port": ...}`
//! records. A missing file is an empty list.

use fsync_core::{PeerAddress, PeerStore, PeerStoreError};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// File name used when no platform config directory is available.
pub const FALLBACK_PEERS_FILE: &str = "peer_data.json";

/// Default location: `<config dir>/fsync/peers.json`, else `./peer_data.json`.
pub fn default_peers_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("fsync").join("peers.json"))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_PEERS_FILE))
}

/// Peer list backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonPeerStore {
    path: PathBuf,
}

impl JsonPeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> PeerStoreError {
        PeerStoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl PeerStore for JsonPeerStore {
    fn load(&self) -> Result<Vec<PeerAddress>, PeerStoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let peers: Vec<PeerAddress> =
            serde_json::from_str(&contents).map_err(|e| PeerStoreError::Malformed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        debug!("Loaded {} peers from {}", peers.len(), self.path.display());
        Ok(peers)
    }

    fn save(&self, peers: &[PeerAddress]) -> Result<(), PeerStoreError> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(peers).map_err(|e| PeerStoreError::Malformed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        fs::write(&self.path, contents).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}
