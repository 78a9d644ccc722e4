//! Boxed (sealed) messages: what the server stores and relays.
//!
//! The server sees:
//!   - the envelope version and its forward-compat metadata
//!   - the client header as claimed by the sender (needed for routing,
//!     listing and sorting; re-checked against the signed copy on unbox)
//!   - the sealed header ciphertext and the body ciphertext (opaque)
//!   - the verification key + key generation used
//!
//! `server_header` is absent until the server has accepted the message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::header::{ClientHeader, MessageType};
use crate::ids::{hex_bytes, DeviceId, MessageId, OutboxId};
use crate::version::MetaInfo;

/// Metadata assigned by the server when it accepts a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHeader {
    pub message_id: MessageId,
    /// Set when a later edit/delete supersedes this message.
    #[serde(default)]
    pub superseded_by: MessageId,
    /// Server receive time.
    pub ctime: DateTime<Utc>,
    /// Time this client received the message, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtime: Option<DateTime<Utc>>,
}

/// MAC over the header hash for one recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseMac {
    pub device: DeviceId,
    #[serde(with = "hex_bytes")]
    pub mac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxedMessage {
    /// Envelope format revision.
    pub version: u32,
    #[serde(default)]
    pub meta: MetaInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_header: Option<ServerHeader>,
    /// Header as composed by the sender, unauthenticated until unboxed.
    pub client_header: ClientHeader,
    /// XChaCha20-Poly1305 of the signed header (nonce || ct+tag).
    #[serde(with = "hex_bytes")]
    pub header_ciphertext: Vec<u8>,
    /// XChaCha20-Poly1305 of the padded body (nonce || ct+tag).
    #[serde(with = "hex_bytes")]
    pub body_ciphertext: Vec<u8>,
    /// Sender device's Ed25519 public key.
    #[serde(with = "hex_bytes")]
    pub verify_key: Vec<u8>,
    pub key_generation: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pairwise_macs: Vec<PairwiseMac>,
}

impl BoxedMessage {
    /// Server message id, or `MessageId::NONE` before the server accepted it.
    pub fn message_id(&self) -> MessageId {
        self.server_header
            .as_ref()
            .map(|h| h.message_id)
            .unwrap_or(MessageId::NONE)
    }

    pub fn message_type(&self) -> MessageType {
        self.client_header.message_type
    }

    pub fn outbox_id(&self) -> Option<&OutboxId> {
        self.client_header.outbox_id.as_ref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.client_header.is_ephemeral()
    }

    /// Attach the server's acceptance metadata.
    pub fn with_server_header(mut self, header: ServerHeader) -> Self {
        self.server_header = Some(header);
        self
    }
}
