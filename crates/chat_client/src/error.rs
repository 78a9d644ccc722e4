use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] chat_store::StoreError),

    #[error(transparent)]
    Proto(#[from] chat_proto::ProtoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("No sending keys for conversation {0}")]
    MissingKeys(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a sync attempt was abandoned. Local state stays at the last
/// successfully applied version.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Inbox sync transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Inbox sync timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Inbox store failure: {0}")]
    Store(#[from] chat_store::StoreError),
}
