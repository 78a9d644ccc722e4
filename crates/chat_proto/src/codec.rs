//! Body padding.
//!
//! Serialised bodies are padded to fixed size buckets before encryption so
//! the relay sees uniform-sized ciphertext.
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536
//! Bodies larger than 65536 bytes are not padded.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only.
    None,
    /// Pad to fixed-size buckets.
    #[default]
    Buckets,
    /// Pad every body to the largest bucket.
    Maximum,
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];
const MAX_BUCKET: usize = 65536;

/// Pad plaintext to the next bucket boundary.
///
/// Format: [original_len: u32 LE] [plaintext] [random padding]
pub fn pad_to_bucket(plaintext: &[u8], mode: PaddingMode) -> Vec<u8> {
    match mode {
        PaddingMode::None => pad_to_size(plaintext, 4 + plaintext.len()),
        PaddingMode::Buckets => {
            let needed = 4 + plaintext.len();
            let bucket = BUCKET_SIZES
                .iter()
                .copied()
                .find(|&b| b >= needed)
                .unwrap_or(needed);
            pad_to_size(plaintext, bucket)
        }
        PaddingMode::Maximum => pad_to_size(plaintext, MAX_BUCKET.max(4 + plaintext.len())),
    }
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<&[u8], ProtoError> {
    if padded.len() < 4 {
        return Err(ProtoError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(ProtoError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(&padded[4..4 + len])
}

fn pad_to_size(plaintext: &[u8], target: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    // Random fill, not zeros: avoids compression leaks
    let remaining = target.saturating_sub(out.len());
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_unpad_roundtrip_buckets() {
        let msg = b"Hello, World!";
        let padded = pad_to_bucket(msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn pad_large_body_to_next_bucket() {
        let msg = vec![0x42u8; 5000];
        let padded = pad_to_bucket(&msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 16384);
        assert_eq!(unpad(&padded).unwrap(), &msg[..]);
    }

    #[test]
    fn no_padding_keeps_length_prefix() {
        let padded = pad_to_bucket(b"tiny", PaddingMode::None);
        assert_eq!(padded.len(), 8);
        assert_eq!(pad_to_bucket(b"tiny", PaddingMode::Maximum).len(), 65536);
    }

    #[test]
    fn bogus_length_prefix_rejected() {
        let mut padded = pad_to_bucket(b"abc", PaddingMode::None);
        padded[0] = 0xff;
        assert!(matches!(unpad(&padded), Err(ProtoError::InvalidPadding(_))));
    }
}
