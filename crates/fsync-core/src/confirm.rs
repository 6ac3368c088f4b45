//! Operator confirmation before the listener accepts files.

use crate::fingerprint::FileFingerprint;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error("Confirmation input closed")]
    InputClosed,

    #[error("Confirmation I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What the peer wants to send.
#[derive(Debug, Clone, Copy)]
pub struct TransferOffer<'a> {
    pub files: &'a [FileFingerprint],
    pub total_size: u64,
}

/// Decides whether an offered transfer goes ahead.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, offer: &TransferOffer<'_>) -> Result<bool, ConfirmError>;
}

/// Answers every offer the same way.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, _offer: &TransferOffer<'_>) -> Result<bool, ConfirmError> {
        Ok(self.0)
    }
}
