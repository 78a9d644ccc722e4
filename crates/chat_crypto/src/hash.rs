//! BLAKE3-based hash utilities
//!
//! - Header/body content hashes (bind a body to the header that carries it)
//! - Pairwise MACs over a header hash
//! - Derived outbox IDs

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Keyed hash for MACs.
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    blake3::keyed_hash(key, data).into()
}

/// Hash of an encrypted body, signed into the header at seal time.
pub fn body_hash(body_ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"chat-body-hash-v1\x00");
    hasher.update(body_ciphertext);
    hasher.finalize().into()
}

/// Hash of a sealed header; previous-message pointers commit to this value.
pub fn header_hash(header_ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"chat-header-hash-v1\x00");
    hasher.update(header_ciphertext);
    hasher.finalize().into()
}

/// MAC of a header hash for one recipient device.
pub fn pairwise_mac(pairwise_key: &[u8; 32], header_hash: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(pairwise_key);
    hasher.update(b"chat-pairwise-mac-v1\x00");
    hasher.update(header_hash);
    hasher.finalize().into()
}

/// Derive an 8-byte ID from arbitrary seed material (idempotent re-sends).
pub fn derive_short_id(seed: &[u8]) -> [u8; 8] {
    let h = blake3::hash(seed);
    let mut out = [0u8; 8];
    out.copy_from_slice(&h.as_bytes()[..8]);
    out
}

/// Constant-time comparison to prevent timing side channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
