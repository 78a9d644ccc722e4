use thiserror::Error;

/// Failures of the primitives. Callers above the envelope layer never see
/// which check failed during unboxing; they get an `UnboxErrorKind`.

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Ed25519 signature did not verify")]
    SignatureVerification,

    #[error("XChaCha20-Poly1305 sealing failed")]
    AeadEncrypt,

    #[error("Ciphertext failed authentication")]
    AeadDecrypt,

    #[error("Cannot derive key: {0}")]
    KeyDerivation(String),

    #[error("Bad key material: {0}")]
    InvalidKey(String),

    #[error("JSON encoding: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Malformed hex: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Malformed base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
