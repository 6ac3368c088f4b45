//! Peer addresses and the peer list abstraction.
//!
//! The orchestrator only ever sees a `[PeerAddress]`. Where that list lives
//! (a JSON file, memory, a discovery result) is behind [`PeerStore`].

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::RwLock;
use thiserror::Error;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 2000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerAddressError {
    #[error("Peer host is empty")]
    EmptyHost,
    #[error("Invalid port {0:?}: expected 1-65535")]
    InvalidPort(String),
    #[error("Malformed peer address {0:?}")]
    Malformed(String),
}

/// A dialable `(host, port)` pair.
///
/// Serialized as `{"IP": "...", "Port": "..."}` with the port as a string,
/// which is the on-disk peer list format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PeerRecord", into = "PeerRecord")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: &str) -> Result<Self, PeerAddressError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(PeerAddressError::EmptyHost);
        }
        Ok(Self {
            host,
            port: parse_port(port)?,
        })
    }

    pub fn with_port(host: impl Into<String>, port: u16) -> Result<Self, PeerAddressError> {
        Self::new(host, &port.to_string())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

fn parse_port(port: &str) -> Result<u16, PeerAddressError> {
    match port.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(PeerAddressError::InvalidPort(port.to_string())),
        Ok(port) => Ok(port),
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = PeerAddressError;

    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let default_port = DEFAULT_PORT.to_string();

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| PeerAddressError::Malformed(s.to_string()))?;
            return match tail {
                "" => Self::new(host, &default_port),
                _ => match tail.strip_prefix(':') {
                    Some(port) => Self::new(host, port),
                    None => Err(PeerAddressError::Malformed(s.to_string())),
                },
            };
        }

        match s.matches(':').count() {
            0 => Self::new(s, &default_port),
            1 => {
                let (host, port) = s
                    .split_once(':')
                    .ok_or_else(|| PeerAddressError::Malformed(s.to_string()))?;
                Self::new(host, port)
            }
            // Unbracketed IPv6 literal
            _ => Self::new(s, &default_port),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PeerRecord {
    #[serde(rename = "IP")]
    ip: String,
    #[serde(rename = "Port")]
    port: String,
}

impl TryFrom<PeerRecord> for PeerAddress {
    type Error = PeerAddressError;

    fn try_from(record: PeerRecord) -> Result<Self, Self::Error> {
        Self::new(record.ip, &record.port)
    }
}

impl From<PeerAddress> for PeerRecord {
    fn from(addr: PeerAddress) -> Self {
        Self {
            ip: addr.host,
            port: addr.port.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("Peer list I/O failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed peer list {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Peer list lock poisoned")]
    Poisoned,
}

/// Where registered peers are kept.
pub trait PeerStore: Send + Sync {
    fn load(&self) -> Result<Vec<PeerAddress>, PeerStoreError>;

    fn save(&self, peers: &[PeerAddress]) -> Result<(), PeerStoreError>;

    /// Add `peer` unless already present. Returns whether it was added.
    fn append(&self, peer: PeerAddress) -> Result<bool, PeerStoreError> {
        let mut peers = self.load()?;
        if peers.contains(&peer) {
            return Ok(false);
        }
        peers.push(peer);
        self.save(&peers)?;
        Ok(true)
    }
}

/// Peer list held in memory.
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    peers: RwLock<Vec<PeerAddress>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: Vec<PeerAddress>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }
}

impl PeerStore for MemoryPeerStore {
    fn load(&self) -> Result<Vec<PeerAddress>, PeerStoreError> {
        let peers = self.peers.read().map_err(|_| PeerStoreError::Poisoned)?;
        Ok(peers.clone())
    }

    fn save(&self, peers: &[PeerAddress]) -> Result<(), PeerStoreError> {
        let mut stored = self.peers.write().map_err(|_| PeerStoreError::Poisoned)?;
        *stored = peers.to_vec();
        Ok(())
    }
}
