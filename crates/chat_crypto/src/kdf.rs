//! Key derivation functions
//!
//! `vault_key_from_password`: Argon2id, derives the 32-byte key used to
//!   encrypt outbox records at rest.
//!
//! `header_key` / `body_key` / `ephemeral_body_key`: HKDF-SHA256 over the
//!   conversation key for one key generation.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

const ENVELOPE_SALT: &[u8] = b"chat-envelope-v1";

// ── Vault key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte vault key derived from user password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

/// Argon2id parameters, tuned for interactive (desktop) use.
fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a vault key from a user password + 16-byte salt.
/// The salt is stored alongside the database (not secret).
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

/// Generate a fresh random 16-byte salt (call once on first run; store in DB).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

fn envelope_key(conv_key: &[u8; 32], label: &[u8], generation: u32) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut info = Vec::with_capacity(label.len() + 4);
    info.extend_from_slice(label);
    info.extend_from_slice(&generation.to_be_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(conv_key, Some(ENVELOPE_SALT), &info, &mut key[..])?;
    Ok(key)
}

/// Key that seals the signed header of a message.
pub fn header_key(conv_key: &[u8; 32], generation: u32) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    envelope_key(conv_key, b"chat-header-key", generation)
}

/// Key that encrypts a regular (non-exploding) message body.
pub fn body_key(conv_key: &[u8; 32], generation: u32) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    envelope_key(conv_key, b"chat-body-key", generation)
}

/// Body key for exploding messages, derived from the ephemeral seed instead
/// of the long-lived conversation key.
pub fn ephemeral_body_key(seed: &[u8; 32], generation: u32) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    envelope_key(seed, b"chat-ephemeral-body-key", generation)
}
