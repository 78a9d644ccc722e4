//! Device signing keys
//!
//! Each sending *device* holds one `DeviceKeyPair` (Ed25519). The public half
//! travels with every boxed message as its verification key; the receiving
//! side checks it against the key directory for (user, device, generation)
//! before trusting the signature.
//!
//! Signatures are always taken over a domain-separated message so a header
//! signature can never be replayed as some other signed object.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, hex-encoded for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Verify `sig_bytes` over `prefix || msg`.
    pub fn verify(&self, prefix: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let key: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?;
        let vk = VerifyingKey::from_bytes(&key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(&prefixed(prefix, msg), &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

fn prefixed(prefix: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1 + msg.len());
    out.extend_from_slice(prefix);
    out.push(0);
    out.extend_from_slice(msg);
    out
}

// ── Device keypair ────────────────────────────────────────────────────────────

/// Device signing key.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct DeviceKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl DeviceKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Self { public, secret_bytes: signing_key.to_bytes() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Device key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// Sign `prefix || msg`; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, prefix: &[u8], msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes)
            .sign(&prefixed(prefix, msg))
            .to_bytes()
            .to_vec()
    }
}

impl Clone for DeviceKeyPair {
    fn clone(&self) -> Self {
        Self { public: self.public.clone(), secret_bytes: self.secret_bytes }
    }
}

impl std::fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}
