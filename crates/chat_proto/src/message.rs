//! Message bodies (inside the encrypted body container).

use serde::{Deserialize, Serialize, Serializer};

use crate::header::MessageType;
use crate::ids::{MessageId, UserId};
use crate::version::{serialize_versioned, MetaInfo, VersionedWire, MAX_BODY_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        body: String,
    },
    Attachment {
        filename: String,
        mime_type: String,
        size_bytes: u64,
        /// BLAKE3 hash of the unencrypted content.
        content_hash: String,
        /// Opaque reference to the encrypted object in storage.
        storage_ref: String,
    },
    Edit {
        target_message_id: MessageId,
        body: String,
    },
    Delete {
        target_message_ids: Vec<MessageId>,
    },
    Reaction {
        target_message_id: MessageId,
        emoji: String,
    },
    Headline {
        headline: String,
    },
    Join,
    Leave,
    System {
        text: String,
    },
    DeleteHistory {
        up_to: MessageId,
    },
    Pin {
        target_message_id: MessageId,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Text { .. } => MessageType::Text,
            MessageBody::Attachment { .. } => MessageType::Attachment,
            MessageBody::Edit { .. } => MessageType::Edit,
            MessageBody::Delete { .. } => MessageType::Delete,
            MessageBody::Reaction { .. } => MessageType::Reaction,
            MessageBody::Headline { .. } => MessageType::Headline,
            MessageBody::Join => MessageType::Join,
            MessageBody::Leave => MessageType::Leave,
            MessageBody::System { .. } => MessageType::System,
            MessageBody::DeleteHistory { .. } => MessageType::DeleteHistory,
            MessageBody::Pin { .. } => MessageType::Pin,
        }
    }

    /// Text that should be scanned for mentions, if any.
    pub fn searchable_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text { body } | MessageBody::Edit { body, .. } => Some(body),
            MessageBody::Headline { headline } => Some(headline),
            _ => None,
        }
    }

    /// `@name` tokens in the body, deduplicated, in order of appearance.
    pub fn at_mentions(&self) -> Vec<String> {
        let Some(text) = self.searchable_text() else {
            return Vec::new();
        };
        let mut out: Vec<String> = Vec::new();
        for token in text.split_whitespace() {
            let Some(name) = token.strip_prefix('@') else {
                continue;
            };
            let name: String = name
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_ascii_lowercase();
            if !name.is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}

/// Version 1 of the body container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPlaintextV1 {
    pub body: MessageBody,
}

/// Versioned body container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "VersionedWire")]
pub enum BodyPlaintext {
    V1(BodyPlaintextV1),
    Unsupported { version: u32, meta: MetaInfo },
}

impl BodyPlaintext {
    pub fn version(&self) -> u32 {
        match self {
            BodyPlaintext::V1(_) => 1,
            BodyPlaintext::Unsupported { version, .. } => *version,
        }
    }
}

impl TryFrom<VersionedWire> for BodyPlaintext {
    type Error = serde_json::Error;

    fn try_from(wire: VersionedWire) -> Result<Self, Self::Error> {
        match wire.v {
            1 => Ok(BodyPlaintext::V1(serde_json::from_value(wire.data)?)),
            v if v > MAX_BODY_VERSION => Ok(BodyPlaintext::Unsupported { version: v, meta: wire.mi }),
            v => Ok(BodyPlaintext::Unsupported { version: v, meta: MetaInfo::CRITICAL }),
        }
    }
}

impl Serialize for BodyPlaintext {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            BodyPlaintext::V1(b) => serialize_versioned(s, 1, MetaInfo::default(), Some(b)),
            BodyPlaintext::Unsupported { version, meta } => {
                serialize_versioned::<_, ()>(s, *version, *meta, None)
            }
        }
    }
}

/// Everything the sender composes for one message, before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePlaintext {
    pub client_header: crate::header::ClientHeader,
    pub body: MessageBody,
    /// Users whose identities must be resolved before the send.
    #[serde(default)]
    pub recipients: Vec<UserId>,
}
