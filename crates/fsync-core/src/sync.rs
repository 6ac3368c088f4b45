//! Session vocabulary shared by both roles: configuration, states,
//! outcomes and errors.

use crate::confirm::ConfirmError;
use crate::fingerprint::ScopeError;
use crate::peers::{PeerAddress, PeerStoreError};
use crate::transport::{DEFAULT_IO_TIMEOUT, MAX_CHUNK_SIZE, TransportConfig, TransportError};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Default time the initiator waits for the listener's operator.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Deadline for connect, handshake and each packet; `None` disables
    pub io_timeout: Option<Duration>,
    /// How long the initiator waits for the accept/decline answer
    pub confirm_timeout: Option<Duration>,
    pub max_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            confirm_timeout: Some(DEFAULT_CONFIRM_TIMEOUT),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            io_timeout: self.io_timeout,
            max_chunk_size: self.max_chunk_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Connected,
    HandshakeDone,
    HashesExchanged,
    AwaitingConfirmation,
    Transferring,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    Connecting,
    HandshakeDone,
    HashesExchanged,
    Sending,
    Done,
    Aborted,
}

/// The exchange a session was in when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    Connect,
    Handshake,
    SendFingerprints,
    ReceiveFingerprints,
    SendUniqueList,
    ReceiveUniqueList,
    SendConfirmation,
    ReceiveConfirmation,
    Upload(String),
    Download(String),
}

impl Display for SyncStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "while connecting"),
            Self::Handshake => write!(f, "while exchanging keys"),
            Self::SendFingerprints => write!(f, "while sending fingerprints"),
            Self::ReceiveFingerprints => write!(f, "while receiving peer fingerprints"),
            Self::SendUniqueList => write!(f, "while sending the missing-file list"),
            Self::ReceiveUniqueList => write!(f, "while receiving the missing-file list"),
            Self::SendConfirmation => write!(f, "while sending confirmation"),
            Self::ReceiveConfirmation => write!(f, "while waiting for confirmation"),
            Self::Upload(name) => write!(f, "while uploading {name}"),
            Self::Download(name) => write!(f, "while downloading {name}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync directory error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Failed {step}: {source}")]
    Transport {
        step: SyncStep,
        #[source]
        source: TransportError,
    },

    #[error("Protocol violation {step}: {reason}")]
    Protocol { step: SyncStep, reason: String },

    #[error("Confirmation failed: {0}")]
    Confirm(#[from] ConfirmError),

    #[error("Peer list unavailable: {0}")]
    PeerStore(#[from] PeerStoreError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Attach the failing step to a transport error.
pub(crate) fn during(step: SyncStep) -> impl FnOnce(TransportError) -> SyncError {
    move |source| SyncError::Transport { step, source }
}

/// How a listener session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    Received { files: usize, bytes: u64 },
    /// The operator declined; nothing was written
    Declined,
}

/// How an initiator session with one peer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Sent { files: usize, bytes: u64 },
    Declined,
}

/// Result of one peer's session in a multi-peer sync.
#[derive(Debug)]
pub struct PeerReport {
    pub peer: PeerAddress,
    pub result: Result<PushOutcome>,
}

impl PeerReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
