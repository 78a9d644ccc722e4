//! chat_crypto — cryptographic primitives behind the chat message envelope
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity` — Ed25519 device signing keys + public key newtype
//! - `aead`     — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`      — HKDF (header/body/ephemeral keys) and Argon2id (vault key)
//! - `hash`     — BLAKE3 utilities (header/body hashes, pairwise MACs)
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;

pub use error::CryptoError;
