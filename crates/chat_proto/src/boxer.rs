//! Envelope codec.
//!
//! Sealing:
//!   1. body  → versioned container → padded → encrypted under the body key
//!   2. body hash = BLAKE3(body ciphertext), bound into the header
//!   3. header → versioned container → signed by the device key
//!   4. {header bytes, signature} → encrypted under the header key
//!   5. optional pairwise MACs over BLAKE3(header ciphertext)
//!
//! Unboxing never fails: every problem is classified into an
//! `UnboxedMessage::Error` with a kind and a recoverable flag.
//!
//! Checks run in this order, stopping at the first failure:
//!   envelope version → header decrypt → signature → header version →
//!   sender key (directory) → header consistency → pairwise MAC →
//!   body hash → body decrypt → body version → body/header type agreement

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use chat_crypto::identity::{DeviceKeyPair, PublicKeyBytes};
use chat_crypto::{aead, hash, kdf};

use crate::boxed::{BoxedMessage, PairwiseMac};
use crate::codec::{pad_to_bucket, unpad, PaddingMode};
use crate::error::ProtoError;
use crate::header::{ClientHeader, HeaderPlaintext, HeaderPlaintextV1};
use crate::ids::{hex_bytes, ConversationId, DeviceId};
use crate::keys::{DecryptionKeys, KeyDirectory};
use crate::message::{BodyPlaintext, BodyPlaintextV1, MessageBody};
use crate::unboxed::{MessageUnboxedError, MessageUnboxedValid, UnboxErrorKind, UnboxedMessage, VersionError};
use crate::version::{MetaInfo, VersionKind, MAX_ENVELOPE_VERSION};

/// Envelope version produced by `seal`.
pub const CURRENT_ENVELOPE_VERSION: u32 = 1;

const HEADER_SIG_PREFIX: &[u8] = b"chat-header-sig-v1";

/// Keys the sending device seals with.
pub struct SenderKeys<'a> {
    pub device_key: &'a DeviceKeyPair,
    pub generation: u32,
    pub conv_key: &'a [u8; 32],
    /// Required for exploding messages.
    pub ephemeral_seed: Option<&'a [u8; 32]>,
    /// (recipient device, pairwise key); empty means no MACs.
    pub pairwise: Vec<(DeviceId, [u8; 32])>,
}

/// Encrypted header payload: the exact header bytes that were signed.
#[derive(Serialize, Deserialize)]
struct SignedHeader {
    #[serde(with = "hex_bytes")]
    header: Vec<u8>,
    #[serde(with = "hex_bytes")]
    signature: Vec<u8>,
}

struct UnboxingError {
    kind: UnboxErrorKind,
    message: String,
    permanent: bool,
    version_error: Option<VersionError>,
}

impl UnboxingError {
    fn permanent(kind: UnboxErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), permanent: true, version_error: None }
    }

    fn transient(kind: UnboxErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), permanent: false, version_error: None }
    }

    fn version(kind: VersionKind, version: u32, meta: MetaInfo) -> Self {
        let err_kind = if meta.critical {
            UnboxErrorKind::BadVersionCritical
        } else {
            UnboxErrorKind::BadVersion
        };
        Self {
            kind: err_kind,
            message: format!("unsupported {kind} version {version}"),
            permanent: true,
            version_error: Some(VersionError { kind, version }),
        }
    }
}

fn envelope_aad(conv_id: &ConversationId, generation: u32, part: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(conv_id.as_bytes().len() + 4 + part.len() + 1);
    aad.extend_from_slice(part);
    aad.push(0);
    aad.extend_from_slice(conv_id.as_bytes());
    aad.extend_from_slice(&generation.to_be_bytes());
    aad
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Boxer {
    padding: PaddingMode,
}

impl Boxer {
    pub fn new(padding: PaddingMode) -> Self {
        Self { padding }
    }

    pub fn padding(&self) -> PaddingMode {
        self.padding
    }

    /// Seal a composed header and body into a boxed message.
    pub fn seal(
        &self,
        header: &ClientHeader,
        body: &MessageBody,
        keys: &SenderKeys<'_>,
    ) -> Result<BoxedMessage, ProtoError> {
        if header.message_type != body.message_type() {
            return Err(ProtoError::Seal(format!(
                "header type {} does not match body type {}",
                header.message_type,
                body.message_type()
            )));
        }
        let conv_id = header.conv.conversation_id();

        let body_key = match &header.ephemeral_metadata {
            Some(meta) => {
                let seed = keys
                    .ephemeral_seed
                    .ok_or_else(|| ProtoError::Seal("exploding message without ephemeral seed".into()))?;
                kdf::ephemeral_body_key(seed, meta.generation)?
            }
            None => kdf::body_key(keys.conv_key, keys.generation)?,
        };
        let body_bytes = Zeroizing::new(serde_json::to_vec(&BodyPlaintext::V1(BodyPlaintextV1 {
            body: body.clone(),
        }))?);
        let padded = Zeroizing::new(pad_to_bucket(&body_bytes, self.padding));
        let body_ciphertext = aead::encrypt(
            &body_key,
            &padded,
            &envelope_aad(&conv_id, keys.generation, b"body"),
        )?;
        let body_hash = hash::body_hash(&body_ciphertext);

        let header_bytes = serde_json::to_vec(&HeaderPlaintext::V1(HeaderPlaintextV1 {
            client: header.clone(),
            body_hash: body_hash.to_vec(),
        }))?;
        let signature = keys.device_key.sign(HEADER_SIG_PREFIX, &header_bytes);
        let signed = serde_json::to_vec(&SignedHeader { header: header_bytes, signature })?;
        let header_key = kdf::header_key(keys.conv_key, keys.generation)?;
        let header_ciphertext = aead::encrypt(
            &header_key,
            &signed,
            &envelope_aad(&conv_id, keys.generation, b"header"),
        )?;

        let header_hash = hash::header_hash(&header_ciphertext);
        let pairwise_macs = keys
            .pairwise
            .iter()
            .map(|(device, key)| PairwiseMac {
                device: device.clone(),
                mac: hash::pairwise_mac(key, &header_hash).to_vec(),
            })
            .collect();

        debug!(conv_id = %conv_id, message_type = %header.message_type, "sealed message");

        Ok(BoxedMessage {
            version: CURRENT_ENVELOPE_VERSION,
            meta: MetaInfo::default(),
            server_header: None,
            client_header: header.clone(),
            header_ciphertext,
            body_ciphertext,
            verify_key: keys.device_key.public.0.clone(),
            key_generation: keys.generation,
            pairwise_macs,
        })
    }

    /// Open and classify a boxed message. Never fails.
    pub fn unbox(
        &self,
        boxed: &BoxedMessage,
        directory: &dyn KeyDirectory,
        keys: &dyn DecryptionKeys,
    ) -> UnboxedMessage {
        match self.try_unbox(boxed, directory, keys) {
            Ok(valid) => UnboxedMessage::Valid(Box::new(valid)),
            Err(err) => {
                warn!(
                    conv_id = %boxed.client_header.conv.conversation_id(),
                    message_id = %boxed.message_id(),
                    kind = err.kind.as_str(),
                    recoverable = !err.permanent,
                    "failed to unbox message: {}",
                    err.message
                );
                UnboxedMessage::Error(Box::new(error_message(boxed, err)))
            }
        }
    }

    fn try_unbox(
        &self,
        boxed: &BoxedMessage,
        directory: &dyn KeyDirectory,
        keys: &dyn DecryptionKeys,
    ) -> Result<MessageUnboxedValid, UnboxingError> {
        if boxed.version == 0 || boxed.version > MAX_ENVELOPE_VERSION {
            let meta = if boxed.version == 0 { MetaInfo::CRITICAL } else { boxed.meta };
            return Err(UnboxingError::version(VersionKind::Envelope, boxed.version, meta));
        }

        let conv_id = boxed.client_header.conv.conversation_id();
        let generation = boxed.key_generation;
        let conv_key = keys.conversation_key(&conv_id, generation).ok_or_else(|| {
            UnboxingError::transient(
                UnboxErrorKind::Misc,
                format!("no conversation key for generation {generation}"),
            )
        })?;

        // Header
        let header_key = kdf::header_key(&conv_key, generation)
            .map_err(|e| UnboxingError::permanent(UnboxErrorKind::Misc, e.to_string()))?;
        let signed_bytes = aead::decrypt(
            &header_key,
            &boxed.header_ciphertext,
            &envelope_aad(&conv_id, generation, b"header"),
        )
        .map_err(|_| UnboxingError::permanent(UnboxErrorKind::Misc, "header decryption failed"))?;
        let signed: SignedHeader = serde_json::from_slice(&signed_bytes)
            .map_err(|e| UnboxingError::permanent(UnboxErrorKind::Misc, format!("malformed signed header: {e}")))?;

        let verify_key = PublicKeyBytes::from_slice(&boxed.verify_key)
            .map_err(|e| UnboxingError::permanent(UnboxErrorKind::Misc, e.to_string()))?;
        verify_key
            .verify(HEADER_SIG_PREFIX, &signed.header, &signed.signature)
            .map_err(|_| UnboxingError::permanent(UnboxErrorKind::Misc, "header signature verification failed"))?;

        let header = match serde_json::from_slice::<HeaderPlaintext>(&signed.header) {
            Ok(HeaderPlaintext::V1(h)) => h,
            Ok(HeaderPlaintext::Unsupported { version, meta }) => {
                return Err(UnboxingError::version(VersionKind::Header, version, meta))
            }
            Err(e) => {
                return Err(UnboxingError::permanent(
                    UnboxErrorKind::Misc,
                    format!("malformed header: {e}"),
                ))
            }
        };
        let client = &header.client;

        // Sender key
        let sender_device_revoked_at =
            check_sender_key(directory, client, generation, &boxed.verify_key)?;

        check_header_consistency(&boxed.client_header, client)?;

        // Pairwise MACs
        let header_hash = hash::header_hash(&boxed.header_ciphertext);
        if !boxed.pairwise_macs.is_empty() {
            let own = keys.own_device();
            let entry = boxed.pairwise_macs.iter().find(|m| &m.device == own).ok_or_else(|| {
                UnboxingError::permanent(UnboxErrorKind::PairwiseKeyMissing, "no MAC for this device")
            })?;
            let pairwise_key = keys.pairwise_key(&client.sender_device).ok_or_else(|| {
                UnboxingError::permanent(UnboxErrorKind::PairwiseKeyMissing, "no pairwise key for sender device")
            })?;
            let expected = hash::pairwise_mac(&pairwise_key, &header_hash);
            if !hash::constant_time_eq(&expected, &entry.mac) {
                return Err(UnboxingError::permanent(UnboxErrorKind::Misc, "pairwise MAC mismatch"));
            }
        }

        // Body
        let body_hash = hash::body_hash(&boxed.body_ciphertext);
        if !hash::constant_time_eq(&body_hash, &header.body_hash) {
            return Err(UnboxingError::permanent(UnboxErrorKind::Misc, "body hash mismatch"));
        }
        let body_key = match &client.ephemeral_metadata {
            Some(meta) => {
                let seed = keys.ephemeral_seed(&conv_id, meta.generation).ok_or_else(|| {
                    UnboxingError::permanent(
                        UnboxErrorKind::Ephemeral,
                        format!("ephemeral key generation {} unavailable", meta.generation),
                    )
                })?;
                kdf::ephemeral_body_key(&seed, meta.generation)
            }
            None => kdf::body_key(&conv_key, generation),
        }
        .map_err(|e| UnboxingError::permanent(UnboxErrorKind::Misc, e.to_string()))?;
        let padded = aead::decrypt(
            &body_key,
            &boxed.body_ciphertext,
            &envelope_aad(&conv_id, generation, b"body"),
        )
        .map_err(|_| UnboxingError::permanent(UnboxErrorKind::Misc, "body decryption failed"))?;
        let body_bytes = unpad(&padded).map_err(|e| UnboxingError::permanent(UnboxErrorKind::Misc, e.to_string()))?;
        let body = match serde_json::from_slice::<BodyPlaintext>(body_bytes) {
            Ok(BodyPlaintext::V1(b)) => b.body,
            Ok(BodyPlaintext::Unsupported { version, meta }) => {
                return Err(UnboxingError::version(VersionKind::Body, version, meta))
            }
            Err(e) => {
                return Err(UnboxingError::permanent(UnboxErrorKind::Misc, format!("malformed body: {e}")))
            }
        };
        if body.message_type() != client.message_type {
            return Err(UnboxingError::permanent(
                UnboxErrorKind::Misc,
                format!("body type {} under header type {}", body.message_type(), client.message_type),
            ));
        }

        let at_mentions = body.at_mentions();
        Ok(MessageUnboxedValid {
            server_header: boxed.server_header.clone(),
            client_header: header.client,
            body,
            header_hash: header_hash.to_vec(),
            body_hash: body_hash.to_vec(),
            verify_key: boxed.verify_key.clone(),
            key_generation: generation,
            at_mentions,
            sender_device_revoked_at,
        })
    }
}

/// Returns the revocation time when the device was revoked after the
/// message was sent.
fn check_sender_key(
    directory: &dyn KeyDirectory,
    client: &ClientHeader,
    generation: u32,
    verify_key: &[u8],
) -> Result<Option<DateTime<Utc>>, UnboxingError> {
    let info = directory
        .lookup(&client.sender, &client.sender_device, generation)
        .map_err(|e| UnboxingError::transient(UnboxErrorKind::Misc, e.to_string()))?
        .ok_or_else(|| {
            UnboxingError::permanent(
                UnboxErrorKind::Identify,
                format!("unknown key for device {} at generation {generation}", client.sender_device),
            )
        })?;
    if !hash::constant_time_eq(&info.verify_key, verify_key) {
        return Err(UnboxingError::permanent(
            UnboxErrorKind::Identify,
            "verify key does not belong to sender device",
        ));
    }
    match info.revoked_at {
        Some(revoked) if revoked <= client.ctime => Err(UnboxingError::permanent(
            UnboxErrorKind::Identify,
            format!("sender device revoked at {revoked}, before message ctime {}", client.ctime),
        )),
        other => Ok(other),
    }
}

fn check_header_consistency(server_visible: &ClientHeader, signed: &ClientHeader) -> Result<(), UnboxingError> {
    let field = if server_visible.conv != signed.conv {
        "conversation"
    } else if server_visible.sender != signed.sender {
        "sender"
    } else if server_visible.sender_device != signed.sender_device {
        "sender device"
    } else if server_visible.message_type != signed.message_type {
        "message type"
    } else if server_visible.outbox_id != signed.outbox_id {
        "outbox id"
    } else {
        return Ok(());
    };
    Err(UnboxingError::permanent(
        UnboxErrorKind::Misc,
        format!("server-visible header {field} does not match signed header"),
    ))
}

fn error_message(boxed: &BoxedMessage, err: UnboxingError) -> MessageUnboxedError {
    let header = &boxed.client_header;
    MessageUnboxedError {
        kind: err.kind,
        message: err.message,
        recoverable: !err.permanent,
        version_error: err.version_error,
        message_id: boxed.message_id(),
        message_type: header.message_type,
        ctime: boxed.server_header.as_ref().map(|h| h.ctime).or(Some(header.ctime)),
        sender: header.sender.clone(),
        sender_device: header.sender_device.clone(),
        is_ephemeral: header.is_ephemeral(),
        outbox_id: header.outbox_id.clone(),
    }
}
