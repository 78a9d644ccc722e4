//! Database handle over SQLite via sqlx.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use tracing::info;

use crate::error::StoreError;
use crate::vault::Vault;

const VAULT_SALT_KEY: &str = "vault_salt";
const VALUE_AAD_PREFIX: &[u8] = b"chat-store-v1";

/// Central store handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection, not in a migration: SQLite refuses
    /// to change `journal_mode` inside the transaction sqlx wraps migrations in.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!(path = %db_path.display(), "opened chat store");
        Ok(Self { pool, vault })
    }

    /// Per-database Argon2 salt, created on first use. Not secret.
    pub async fn vault_salt(&self) -> Result<[u8; 16], StoreError> {
        let existing: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(VAULT_SALT_KEY)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(hex_salt) = existing {
            let bytes = hex::decode(&hex_salt).map_err(chat_crypto::CryptoError::from)?;
            return bytes
                .try_into()
                .map_err(|_| StoreError::Corrupt("vault salt is not 16 bytes".into()));
        }

        let salt = chat_crypto::kdf::generate_salt();
        // A concurrent opener may have won the race; re-read whatever landed.
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(VAULT_SALT_KEY)
            .bind(hex::encode(salt))
            .execute(&self.pool)
            .await?;
        let stored: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(VAULT_SALT_KEY)
            .fetch_one(&self.pool)
            .await?;
        let bytes = hex::decode(&stored).map_err(chat_crypto::CryptoError::from)?;
        bytes
            .try_into()
            .map_err(|_| StoreError::Corrupt("vault salt is not 16 bytes".into()))
    }

    /// Derive the vault key from `password` and this database's salt.
    pub async fn unlock(&self, password: &[u8]) -> Result<(), StoreError> {
        let salt = self.vault_salt().await?;
        self.vault.unlock(password, &salt).await
    }

    /// Encrypt with the vault key. `context` is bound as associated data, so a
    /// ciphertext only decrypts under the row it was written for.
    pub async fn encrypt_value(&self, plaintext: &[u8], context: &[u8]) -> Result<String, StoreError> {
        let aad = value_aad(context);
        self.vault
            .with_key(|key| {
                let ct = chat_crypto::aead::encrypt(key, plaintext, &aad)?;
                Ok(URL_SAFE_NO_PAD.encode(ct))
            })
            .await
    }

    pub async fn decrypt_value(&self, b64: &str, context: &[u8]) -> Result<Vec<u8>, StoreError> {
        let ct = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(chat_crypto::CryptoError::from)?;
        let aad = value_aad(context);
        self.vault
            .with_key(|key| {
                let pt = chat_crypto::aead::decrypt(key, &ct, &aad)?;
                Ok(pt.to_vec())
            })
            .await
    }
}

fn value_aad(context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(VALUE_AAD_PREFIX.len() + 1 + context.len());
    aad.extend_from_slice(VALUE_AAD_PREFIX);
    aad.push(0);
    aad.extend_from_slice(context);
    aad
}
