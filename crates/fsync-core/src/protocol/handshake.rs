//! Ephemeral key exchange and the directional cipher contexts it yields.
//!
//! Wire sequence, listener-anchored, one frame per value:
//!
//! 1. listener public key
//! 2. initiator public key
//! 3. initiator encapsulated key
//! 4. listener encapsulated key
//!
//! Each side encapsulates a fresh X25519 share against the peer's public key
//! and derives its sealing context from that; the opening context comes from
//! decapsulating the blob the peer addressed to us. The blob carries an HMAC
//! over the KEM context so a corrupted blob is rejected during the handshake
//! rather than at the first `open`.
//!
//! No identity is bound into the exchange. Any peer that speaks the protocol
//! completes the handshake.

use super::frame::{self, FrameError};
use super::packet::{CodecError, Packet, PayloadType};
use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Protocol-wide context mixed into every key derivation.
pub const PROTOCOL_CONTEXT: &[u8] = b"fsync/v1 hpke-lite";

pub const PUBLIC_KEY_LEN: usize = 32;
const CONFIRM_TAG_LEN: usize = 32;
pub const ENCAPSULATED_KEY_LEN: usize = PUBLIC_KEY_LEN + CONFIRM_TAG_LEN;

const AES_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Key exchange I/O failed: {0}")]
    Frame(#[from] FrameError),

    #[error("Malformed key exchange packet: {0}")]
    Codec(#[from] CodecError),

    #[error("Key exchange step out of order: expected {expected}, received {received}")]
    OutOfOrder { expected: i64, received: i64 },

    #[error("Invalid {what}: expected {expected} bytes, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Key exchange produced a non-contributory shared secret")]
    NonContributory,

    #[error("Encapsulated key failed verification")]
    KeyConfirmation,

    #[error("Key derivation failed")]
    KeyDerivation,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to seal packet body")]
    Seal,

    #[error("Failed to open packet body (corrupt ciphertext or desynchronized session)")]
    Open,

    #[error("Nonce sequence exhausted")]
    SequenceExhausted,
}

pub type Result<T> = std::result::Result<T, HandshakeError>;

#[derive(Zeroize, ZeroizeOnDrop)]
struct DirectionKeys {
    key: [u8; AES_KEY_SIZE],
    base_nonce: [u8; NONCE_SIZE],
    confirm_key: [u8; 32],
}

impl DirectionKeys {
    /// HKDF over the DH output, with `enc || recipient` as the KEM context.
    fn derive(shared: &[u8], enc: &[u8; 32], recipient: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(PROTOCOL_CONTEXT), shared);
        let mut keys = Self {
            key: [0u8; AES_KEY_SIZE],
            base_nonce: [0u8; NONCE_SIZE],
            confirm_key: [0u8; 32],
        };
        let expand = |label: &[u8], out: &mut [u8]| {
            hkdf.expand_multi_info(&[label, enc.as_slice(), recipient.as_slice()], out)
                .map_err(|_| HandshakeError::KeyDerivation)
        };
        expand(b"key", &mut keys.key)?;
        expand(b"nonce", &mut keys.base_nonce)?;
        expand(b"confirm", &mut keys.confirm_key)?;
        Ok(keys)
    }

    fn confirm_mac(&self, enc: &[u8; 32], recipient: &[u8; 32]) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.confirm_key)
            .map_err(|_| HandshakeError::KeyDerivation)?;
        mac.update(enc);
        mac.update(recipient);
        Ok(mac)
    }
}

/// One direction of the channel: an AEAD key plus a nonce sequence.
struct CipherContext {
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_SIZE],
    seq: u64,
}

impl CipherContext {
    fn new(keys: &DirectionKeys) -> Result<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(&keys.key).map_err(|_| HandshakeError::KeyDerivation)?;
        Ok(Self {
            cipher,
            base_nonce: keys.base_nonce,
            seq: 0,
        })
    }

    fn next_nonce(&mut self) -> std::result::Result<[u8; NONCE_SIZE], SessionError> {
        let mut nonce = self.base_nonce;
        for (byte, seq_byte) in nonce[NONCE_SIZE - 8..]
            .iter_mut()
            .zip(self.seq.to_be_bytes())
        {
            *byte ^= seq_byte;
        }
        self.seq = self
            .seq
            .checked_add(1)
            .ok_or(SessionError::SequenceExhausted)?;
        Ok(nonce)
    }
}

impl Drop for CipherContext {
    fn drop(&mut self) {
        self.base_nonce.zeroize();
    }
}

/// The pair of cipher contexts bound to one connection.
///
/// The listener's sealing context matches the initiator's opening context
/// and vice versa. Both advance a per-direction counter, so packets must be
/// opened in the order they were sealed.
pub struct SecureSession {
    sealer: CipherContext,
    opener: CipherContext,
}

impl SecureSession {
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> std::result::Result<Vec<u8>, SessionError> {
        let nonce = self.sealer.next_nonce()?;
        self.sealer
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                AeadPayload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SessionError::Seal)
    }

    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> std::result::Result<Vec<u8>, SessionError> {
        let nonce = self.opener.next_nonce()?;
        self.opener
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                AeadPayload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| SessionError::Open)
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("sealed", &self.sealer.seq)
            .field("opened", &self.opener.seq)
            .finish_non_exhaustive()
    }
}

/// Run the handshake as the accepting side.
pub async fn establish_as_listener<S>(stream: &mut S) -> Result<SecureSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    send_key_material(stream, 0, public.as_bytes()).await?;
    let peer_public = parse_public_key(&recv_key_material(stream, 1).await?)?;
    let peer_blob = recv_key_material(stream, 2).await?;

    let opener = decapsulate(secret, &public, &peer_blob)?;
    let (blob, sealer) = encapsulate(&peer_public)?;
    send_key_material(stream, 3, &blob).await?;

    debug!("Handshake complete (listener)");
    Ok(SecureSession { sealer, opener })
}

/// Run the handshake as the dialing side.
pub async fn establish_as_initiator<S>(stream: &mut S) -> Result<SecureSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let peer_public = parse_public_key(&recv_key_material(stream, 0).await?)?;
    send_key_material(stream, 1, public.as_bytes()).await?;

    let (blob, sealer) = encapsulate(&peer_public)?;
    send_key_material(stream, 2, &blob).await?;

    let peer_blob = recv_key_material(stream, 3).await?;
    let opener = decapsulate(secret, &public, &peer_blob)?;

    debug!("Handshake complete (initiator)");
    Ok(SecureSession { sealer, opener })
}

/// Produce the blob for `recipient` and the context that seals to them.
fn encapsulate(recipient: &PublicKey) -> Result<(Vec<u8>, CipherContext)> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let enc = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let keys = DirectionKeys::derive(shared.as_bytes(), enc.as_bytes(), recipient.as_bytes())?;
    let tag = keys
        .confirm_mac(enc.as_bytes(), recipient.as_bytes())?
        .finalize()
        .into_bytes();

    let mut blob = Vec::with_capacity(ENCAPSULATED_KEY_LEN);
    blob.extend_from_slice(enc.as_bytes());
    blob.extend_from_slice(&tag);
    Ok((blob, CipherContext::new(&keys)?))
}

/// Recover the context that opens what the peer sealed to `own_public`.
fn decapsulate(secret: EphemeralSecret, own_public: &PublicKey, blob: &[u8]) -> Result<CipherContext> {
    if blob.len() != ENCAPSULATED_KEY_LEN {
        return Err(HandshakeError::InvalidLength {
            what: "encapsulated key",
            expected: ENCAPSULATED_KEY_LEN,
            got: blob.len(),
        });
    }
    let (enc_bytes, tag) = blob.split_at(PUBLIC_KEY_LEN);
    let enc = parse_public_key(enc_bytes)?;

    let shared = secret.diffie_hellman(&enc);
    if !shared.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let keys = DirectionKeys::derive(shared.as_bytes(), enc.as_bytes(), own_public.as_bytes())?;
    keys.confirm_mac(enc.as_bytes(), own_public.as_bytes())?
        .verify_slice(tag)
        .map_err(|_| HandshakeError::KeyConfirmation)?;

    CipherContext::new(&keys)
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let raw: [u8; PUBLIC_KEY_LEN] =
        bytes
            .try_into()
            .map_err(|_| HandshakeError::InvalidLength {
                what: "public key",
                expected: PUBLIC_KEY_LEN,
                got: bytes.len(),
            })?;
    Ok(PublicKey::from(raw))
}

async fn send_key_material<S>(stream: &mut S, step: i64, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let packet = Packet::key_material(step, data.to_vec());
    frame::write_frame(stream, &packet.to_bytes()?).await?;
    Ok(())
}

async fn recv_key_material<S>(stream: &mut S, step: i64) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let packet = Packet::from_bytes(&frame::read_frame(stream).await?)?;
    if packet.order_num != step {
        return Err(HandshakeError::OutOfOrder {
            expected: step,
            received: packet.order_num,
        });
    }
    Ok(packet.into_raw(PayloadType::EncryptedEnvelope)?)
}
