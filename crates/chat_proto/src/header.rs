//! Message headers.
//!
//! `ClientHeader` is the header as composed by the sender. The sealed form is
//! a versioned `HeaderPlaintext` that additionally binds the hash of the
//! encrypted body; it is signed by the sender's device key and encrypted
//! separately from the body so that listing/sorting metadata can be
//! authenticated without touching the body.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::ids::{hex_bytes, ConversationId, DeviceId, MessageId, OutboxId, TlfId, TopicId, UserId};
use crate::version::{serialize_versioned, MetaInfo, VersionedWire, MAX_HEADER_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    None,
    Chat,
    Dev,
    KbfsFileEdit,
    Emoji,
}

impl TopicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicType::None => "none",
            TopicType::Chat => "chat",
            TopicType::Dev => "dev",
            TopicType::KbfsFileEdit => "kbfs_file_edit",
            TopicType::Emoji => "emoji",
        }
    }
}

/// The triple that names a conversation: root, topic, topic type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationTriple {
    pub tlf_id: TlfId,
    pub topic_id: TopicId,
    pub topic_type: TopicType,
}

impl ConversationTriple {
    /// Conversation ID as derived from the triple (first 16 bytes of a hash).
    pub fn conversation_id(&self) -> ConversationId {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"chat-conv-id-v1\x00");
        buf.extend_from_slice(self.tlf_id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.topic_type.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.topic_id.as_bytes());
        ConversationId::new(chat_crypto::hash::hash(&buf)[..16].to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    None,
    Text,
    Attachment,
    Edit,
    Delete,
    Metadata,
    Headline,
    AttachmentUploaded,
    Join,
    Leave,
    System,
    DeleteHistory,
    Reaction,
    Unfurl,
    Flip,
    Pin,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::None => "none",
            MessageType::Text => "text",
            MessageType::Attachment => "attachment",
            MessageType::Edit => "edit",
            MessageType::Delete => "delete",
            MessageType::Metadata => "metadata",
            MessageType::Headline => "headline",
            MessageType::AttachmentUploaded => "attachment_uploaded",
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::System => "system",
            MessageType::DeleteHistory => "delete_history",
            MessageType::Reaction => "reaction",
            MessageType::Unfurl => "unfurl",
            MessageType::Flip => "flip",
            MessageType::Pin => "pin",
        }
    }

    /// Types that show up as their own thread entry (and so get an outbox
    /// placeholder while pending).
    pub fn is_visible_in_thread(&self) -> bool {
        matches!(
            self,
            MessageType::Text
                | MessageType::Attachment
                | MessageType::Headline
                | MessageType::Join
                | MessageType::Leave
                | MessageType::System
                | MessageType::Flip
                | MessageType::Pin
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to an earlier message and the hash of its sealed header; lets the
/// reader detect tampering or reordering of history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreviousPointer {
    pub id: MessageId,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

/// Where an outbox message expects to land in its thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxInfo {
    /// Last server message id the sender had seen when composing.
    pub prev: MessageId,
    pub compose_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMetadata {
    pub lifetime_secs: u64,
    /// Ephemeral key generation the body key was derived from.
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploded_by: Option<String>,
}

/// Binds a message to a point in the public key-directory history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRootBinding {
    pub seqno: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

/// Header as composed by the sender, before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeader {
    pub conv: ConversationTriple,
    pub tlf_name: String,
    #[serde(default)]
    pub tlf_public: bool,
    pub message_type: MessageType,
    #[serde(default)]
    pub prev: Vec<MessagePreviousPointer>,
    pub sender: UserId,
    pub sender_device: DeviceId,
    /// Claimed send time.
    pub ctime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_id: Option<OutboxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_info: Option<OutboxInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<MerkleRootBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_metadata: Option<EphemeralMetadata>,
    /// Set when a bot posts on behalf of `sender`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_uid: Option<UserId>,
}

impl ClientHeader {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_metadata.is_some()
    }
}

/// Version 1 of the sealed header: the composed header plus the body binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPlaintextV1 {
    #[serde(flatten)]
    pub client: ClientHeader,
    #[serde(with = "hex_bytes")]
    pub body_hash: Vec<u8>,
}

/// Versioned header container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "VersionedWire")]
pub enum HeaderPlaintext {
    V1(HeaderPlaintextV1),
    Unsupported { version: u32, meta: MetaInfo },
}

impl HeaderPlaintext {
    pub fn version(&self) -> u32 {
        match self {
            HeaderPlaintext::V1(_) => 1,
            HeaderPlaintext::Unsupported { version, .. } => *version,
        }
    }
}

impl TryFrom<VersionedWire> for HeaderPlaintext {
    type Error = serde_json::Error;

    fn try_from(wire: VersionedWire) -> Result<Self, Self::Error> {
        match wire.v {
            1 => Ok(HeaderPlaintext::V1(serde_json::from_value(wire.data)?)),
            v if v > MAX_HEADER_VERSION => Ok(HeaderPlaintext::Unsupported { version: v, meta: wire.mi }),
            // Version 0 never existed; treat it like anything else we cannot read.
            v => Ok(HeaderPlaintext::Unsupported { version: v, meta: MetaInfo::CRITICAL }),
        }
    }
}

impl Serialize for HeaderPlaintext {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            HeaderPlaintext::V1(h) => serialize_versioned(s, 1, MetaInfo::default(), Some(h)),
            HeaderPlaintext::Unsupported { version, meta } => {
                serialize_versioned::<_, ()>(s, *version, *meta, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ClientHeader {
        ClientHeader {
            conv: ConversationTriple {
                tlf_id: TlfId::new(vec![1, 2]),
                topic_id: TopicId::new(vec![3]),
                topic_type: TopicType::Chat,
            },
            tlf_name: "alice,bob".into(),
            tlf_public: false,
            message_type: MessageType::Text,
            prev: vec![],
            sender: UserId::new(vec![0xaa]),
            sender_device: DeviceId::new(vec![0xbb]),
            ctime: Utc::now(),
            outbox_id: None,
            outbox_info: None,
            merkle_root: None,
            ephemeral_metadata: None,
            bot_uid: None,
        }
    }

    #[test]
    fn unknown_header_version_keeps_only_criticality() {
        let json = r#"{"v":7,"mi":{"crit":true},"data":{"whatever":"new"}}"#;
        let parsed: HeaderPlaintext = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            HeaderPlaintext::Unsupported { version: 7, meta: MetaInfo { critical: true } }
        );

        let lenient = r#"{"v":8,"data":{}}"#;
        let parsed: HeaderPlaintext = serde_json::from_str(lenient).unwrap();
        assert_eq!(parsed, HeaderPlaintext::Unsupported { version: 8, meta: MetaInfo::default() });
    }

    #[test]
    fn v1_header_survives_serialisation() {
        let h = HeaderPlaintext::V1(HeaderPlaintextV1 { client: header(), body_hash: vec![9; 32] });
        let bytes = serde_json::to_vec(&h).unwrap();
        let back: HeaderPlaintext = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn conversation_id_depends_on_whole_triple() {
        let a = header().conv;
        let mut b = a.clone();
        b.topic_type = TopicType::Dev;
        assert_ne!(a.conversation_id(), b.conversation_id());
        assert_eq!(a.conversation_id(), header().conv.conversation_id());
    }
}
