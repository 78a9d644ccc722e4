use thiserror::Error;

use crate::ids::OutboxId;
use crate::outbox::OutboxErrorKind;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("Cannot seal message: {0}")]
    Seal(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Outbox record {outbox_id} failed with {kind}, which cannot be retried")]
    RetryRejected { outbox_id: OutboxId, kind: OutboxErrorKind },

    #[error("Outbox record {0} needs recipient identities re-resolved before retry")]
    IdentifyRequired(OutboxId),

    #[error("Inbox version mismatch: local {local}, update {remote}")]
    VersionMismatch { local: u64, remote: u64 },

    #[error("Invalid pagination cursor")]
    InvalidCursor,

    #[error("Crypto error: {0}")]
    Crypto(#[from] chat_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
