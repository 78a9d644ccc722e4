use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked; unlock it first")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] chat_crypto::CryptoError),

    #[error(transparent)]
    Proto(#[from] chat_proto::ProtoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Migration error: {0}")]
    Migration(String),
}
