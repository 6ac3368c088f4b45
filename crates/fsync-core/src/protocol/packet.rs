//! Typed packets: the unit of wire transmission.
//!
//! A [`Packet`] carries a sequence number, a declared [`PayloadType`] and an
//! opaque body. Structured values (fingerprint lists, booleans, integers) are
//! bincode-encoded into the body; file chunks and key material are carried
//! as raw bytes.
//!
//! Decoding always checks the declared payload type first. A packet that
//! claims to be a `Boolean` is never reinterpreted as a fingerprint list.

use crate::fingerprint::FileFingerprint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Packet type mismatch: expected {expected:?}, received {received:?}")]
    TypeMismatch {
        expected: PayloadType,
        received: PayloadType,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// What a packet body contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadType {
    /// Key material exchanged while setting up the encrypted envelope
    EncryptedEnvelope = 0,
    /// A slice of file bytes
    FileChunk = 1,
    /// `Vec<FileFingerprint>`
    FingerprintList = 2,
    /// `i64`
    Integer = 3,
    /// `bool`
    Boolean = 4,
}

/// One framed, typed unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Chunk ordering for multi-packet transfers (zero-based, contiguous)
    pub order_num: i64,
    pub payload_type: PayloadType,
    pub body: Vec<u8>,
}

impl Packet {
    /// Encode `value` into a new packet of the given type.
    pub fn serialize<T: Serialize + ?Sized>(value: &T, payload_type: PayloadType) -> Result<Self> {
        let body =
            bincode::serialize(value).map_err(|e| CodecError::Serialization(e.to_string()))?;
        Ok(Self {
            order_num: 0,
            payload_type,
            body,
        })
    }

    /// Decode the body, failing unless the declared type is `expected`.
    pub fn deserialize<T: DeserializeOwned>(&self, expected: PayloadType) -> Result<T> {
        self.expect_type(expected)?;
        bincode::deserialize(&self.body).map_err(|e| CodecError::Deserialization(e.to_string()))
    }

    /// Encode a value whose payload type is fixed by the [`Payload`] impl.
    pub fn encode<T: Payload>(value: &T) -> Result<Self> {
        Self::serialize(value, T::PAYLOAD_TYPE)
    }

    pub fn decode<T: Payload>(&self) -> Result<T> {
        self.deserialize(T::PAYLOAD_TYPE)
    }

    /// A file chunk; the body is the raw slice, not bincode.
    pub fn chunk(order_num: i64, data: Vec<u8>) -> Self {
        Self {
            order_num,
            payload_type: PayloadType::FileChunk,
            body: data,
        }
    }

    /// Raw key-exchange bytes for handshake step `step`.
    pub fn key_material(step: i64, data: Vec<u8>) -> Self {
        Self {
            order_num: step,
            payload_type: PayloadType::EncryptedEnvelope,
            body: data,
        }
    }

    pub fn expect_type(&self, expected: PayloadType) -> Result<()> {
        if self.payload_type == expected {
            Ok(())
        } else {
            Err(CodecError::TypeMismatch {
                expected,
                received: self.payload_type,
            })
        }
    }

    /// Take the raw body of a packet that must be of type `expected`.
    pub fn into_raw(self, expected: PayloadType) -> Result<Vec<u8>> {
        self.expect_type(expected)?;
        Ok(self.body)
    }

    /// Header bytes bound into the AEAD tag: `order_num (BE) || payload_type`.
    pub fn header_bytes(&self) -> [u8; 9] {
        let mut header = [0u8; 9];
        header[..8].copy_from_slice(&self.order_num.to_be_bytes());
        header[8] = self.payload_type as u8;
        header
    }

    /// Serialize the whole packet for framing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// A value type with a fixed wire payload type.
pub trait Payload: Serialize + DeserializeOwned {
    const PAYLOAD_TYPE: PayloadType;
}

impl Payload for Vec<FileFingerprint> {
    const PAYLOAD_TYPE: PayloadType = PayloadType::FingerprintList;
}

impl Payload for i64 {
    const PAYLOAD_TYPE: PayloadType = PayloadType::Integer;
}

impl Payload for bool {
    const PAYLOAD_TYPE: PayloadType = PayloadType::Boolean;
}
