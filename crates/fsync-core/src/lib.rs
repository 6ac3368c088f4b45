//! fsync-core: peer-to-peer directory push over an encrypted TCP channel.
//!
//! This crate provides:
//! - Content fingerprints for a flat directory and the set difference between two peers
//! - Typed packets and length-prefixed framing
//! - An ephemeral X25519 key exchange yielding AES-256-GCM session keys
//! - Chunked file upload/download over the encrypted transport
//! - The listener and initiator roles of a sync session
//! - Peer addresses and the `PeerStore` abstraction

pub mod confirm;
pub mod fingerprint;
pub mod peers;
pub mod protocol;
pub mod sync;
pub mod sync_engine;
pub mod transport;

pub use confirm::{AutoConfirm, Confirm, ConfirmError, TransferOffer};
pub use fingerprint::{ContentHash, DirectoryScope, FileFingerprint, ScopeError, unique_to};
pub use peers::{DEFAULT_PORT, MemoryPeerStore, PeerAddress, PeerAddressError, PeerStore, PeerStoreError};
pub use protocol::{Packet, PayloadType, SecureSession};
pub use sync::{
    InitiatorState, ListenOutcome, ListenerState, PeerReport, PushOutcome, SyncConfig, SyncError,
    SyncStep,
};
pub use sync_engine::{SyncEngine, SyncListener};
pub use transport::{
    MAX_CHUNK_SIZE, NoProgress, TransferProgress, Transport, TransportConfig, TransportError,
};
