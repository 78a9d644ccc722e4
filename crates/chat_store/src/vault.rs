//! Vault: in-memory key that encrypts outbox records at rest.
//!
//! The key is derived from the user password and a per-database salt
//! (`Store::vault_salt`). Locking drops and zeroizes it; any outbox read or
//! write while locked fails with `StoreError::VaultLocked`. An optional idle
//! timeout locks the vault automatically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use chat_crypto::kdf::vault_key_from_password;

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
    #[zeroize(skip)]
    last_activity: Instant,
}

/// Shared vault handle. Clones refer to the same key.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultInner>>>,
    idle_timeout: Option<Duration>,
}

impl Vault {
    /// A locked vault with no idle timeout.
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)), idle_timeout: None }
    }

    pub fn with_idle_timeout(timeout: Duration) -> Self {
        Self { inner: Arc::new(RwLock::new(None)), idle_timeout: Some(timeout) }
    }

    /// Derive the key from `password` (Argon2id) and unlock.
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let vault_key = vault_key_from_password(password, salt)?;
        self.unlock_with_key(vault_key.0).await;
        Ok(())
    }

    /// Unlock with raw key material (tests, OS keyring).
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key, last_activity: Instant::now() });
    }

    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => self.expired(inner),
            None => true,
        }
    }

    fn expired(&self, inner: &VaultInner) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| inner.last_activity.elapsed() > timeout)
    }

    /// Run `f` with the key. Resets the idle timer; locks and fails if the
    /// timer already ran out.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let mut guard = self.inner.write().await;
        let expired = match guard.as_ref() {
            Some(inner) => self.expired(inner),
            None => return Err(StoreError::VaultLocked),
        };
        if expired {
            *guard = None;
            return Err(StoreError::VaultLocked);
        }
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(&inner.key)
            }
            None => Err(StoreError::VaultLocked),
        }
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}
