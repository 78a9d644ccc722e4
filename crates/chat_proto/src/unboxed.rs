//! Client-visible message states.
//!
//! A message is exactly one of five states. States are never mutated in place;
//! a transition (`Outbox → Valid`, `Placeholder → Valid | Error`) consumes the
//! old instance and yields a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::boxed::ServerHeader;
use crate::error::ProtoError;
use crate::header::{ClientHeader, MessageType};
use crate::ids::{hex_bytes, ConversationId, DeviceId, MessageId, OutboxId, UserId};
use crate::message::MessageBody;
use crate::outbox::OutboxRecord;
use crate::version::VersionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnboxErrorKind {
    Misc,
    /// Unsupported version flagged critical. Never displayed.
    BadVersionCritical,
    BadVersion,
    Identify,
    Ephemeral,
    PairwiseKeyMissing,
}

impl UnboxErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnboxErrorKind::Misc => "misc",
            UnboxErrorKind::BadVersionCritical => "bad_version_critical",
            UnboxErrorKind::BadVersion => "bad_version",
            UnboxErrorKind::Identify => "identify",
            UnboxErrorKind::Ephemeral => "ephemeral",
            UnboxErrorKind::PairwiseKeyMissing => "pairwise_key_missing",
        }
    }
}

/// Which container had an unsupported version, and which version it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionError {
    pub kind: VersionKind,
    pub version: u32,
}

impl VersionError {
    /// Whether this build can now parse the version that failed earlier.
    pub fn is_now_parseable(&self) -> bool {
        self.version >= 1 && self.version <= self.kind.max_supported()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedValid {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_header: Option<ServerHeader>,
    /// The signed header, as authenticated during unboxing.
    pub client_header: ClientHeader,
    pub body: MessageBody,
    #[serde(with = "hex_bytes")]
    pub header_hash: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub body_hash: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub verify_key: Vec<u8>,
    pub key_generation: u32,
    #[serde(default)]
    pub at_mentions: Vec<String>,
    /// Sender device was revoked after this message was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device_revoked_at: Option<DateTime<Utc>>,
}

impl MessageUnboxedValid {
    pub fn message_id(&self) -> MessageId {
        self.server_header.as_ref().map(|h| h.message_id).unwrap_or(MessageId::NONE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedError {
    pub kind: UnboxErrorKind,
    pub message: String,
    /// A later attempt (new keys, directory back online) may succeed.
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_error: Option<VersionError>,
    pub message_id: MessageId,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
    pub sender: UserId,
    pub sender_device: DeviceId,
    #[serde(default)]
    pub is_ephemeral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_id: Option<OutboxId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedPlaceholder {
    pub message_id: MessageId,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneycardType {
    Welcome,
    PopularChannels,
    AddPeople,
    CreateChannels,
    MsgAttention,
    ChannelInactive,
    MsgNoAnswer,
}

impl JourneycardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneycardType::Welcome => "welcome",
            JourneycardType::PopularChannels => "popular_channels",
            JourneycardType::AddPeople => "add_people",
            JourneycardType::CreateChannels => "create_channels",
            JourneycardType::MsgAttention => "msg_attention",
            JourneycardType::ChannelInactive => "channel_inactive",
            JourneycardType::MsgNoAnswer => "msg_no_answer",
        }
    }
}

/// Locally synthesised thread entry; never server-backed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnboxedJourneycard {
    pub card_type: JourneycardType,
    pub conv_id: ConversationId,
    /// Server message the card is shown after.
    pub prev_id: MessageId,
    pub ordinal: u64,
}

impl MessageUnboxedJourneycard {
    pub fn new(card_type: JourneycardType, conv_id: ConversationId, prev_id: MessageId, ordinal: u64) -> Self {
        Self { card_type, conv_id, prev_id, ordinal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Valid,
    Error,
    Outbox,
    Placeholder,
    Journeycard,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Valid => "valid",
            MessageState::Error => "error",
            MessageState::Outbox => "outbox",
            MessageState::Placeholder => "placeholder",
            MessageState::Journeycard => "journeycard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum UnboxedMessage {
    Valid(Box<MessageUnboxedValid>),
    Error(Box<MessageUnboxedError>),
    Outbox(Box<OutboxRecord>),
    Placeholder(MessageUnboxedPlaceholder),
    Journeycard(MessageUnboxedJourneycard),
}

impl UnboxedMessage {
    pub fn state(&self) -> MessageState {
        match self {
            UnboxedMessage::Valid(_) => MessageState::Valid,
            UnboxedMessage::Error(_) => MessageState::Error,
            UnboxedMessage::Outbox(_) => MessageState::Outbox,
            UnboxedMessage::Placeholder(_) => MessageState::Placeholder,
            UnboxedMessage::Journeycard(_) => MessageState::Journeycard,
        }
    }

    /// Server message id for `Valid` and `Error`; `NONE` otherwise.
    pub fn message_id(&self) -> MessageId {
        match self {
            UnboxedMessage::Valid(m) => m.message_id(),
            UnboxedMessage::Error(e) => e.message_id,
            UnboxedMessage::Outbox(_)
            | UnboxedMessage::Placeholder(_)
            | UnboxedMessage::Journeycard(_) => MessageId::NONE,
        }
    }

    /// Message type for `Valid` and `Error`; `MessageType::None` otherwise.
    pub fn message_type(&self) -> MessageType {
        match self {
            UnboxedMessage::Valid(m) => m.client_header.message_type,
            UnboxedMessage::Error(e) => e.message_type,
            UnboxedMessage::Outbox(_)
            | UnboxedMessage::Placeholder(_)
            | UnboxedMessage::Journeycard(_) => MessageType::None,
        }
    }

    pub fn outbox_id(&self) -> Option<&OutboxId> {
        match self {
            UnboxedMessage::Valid(m) => m.client_header.outbox_id.as_ref(),
            UnboxedMessage::Error(e) => e.outbox_id.as_ref(),
            UnboxedMessage::Outbox(r) => Some(&r.outbox_id),
            UnboxedMessage::Placeholder(_) | UnboxedMessage::Journeycard(_) => None,
        }
    }

    pub fn ordinal(&self) -> Option<u64> {
        match self {
            UnboxedMessage::Outbox(r) => Some(r.ordinal),
            UnboxedMessage::Journeycard(j) => Some(j.ordinal),
            UnboxedMessage::Valid(_) | UnboxedMessage::Error(_) | UnboxedMessage::Placeholder(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, UnboxedMessage::Valid(_))
    }

    /// Critical version errors and hidden placeholders are never shown.
    pub fn is_visible(&self) -> bool {
        match self {
            UnboxedMessage::Error(e) => e.kind != UnboxErrorKind::BadVersionCritical,
            UnboxedMessage::Placeholder(p) => !p.hidden,
            UnboxedMessage::Valid(_) | UnboxedMessage::Outbox(_) | UnboxedMessage::Journeycard(_) => true,
        }
    }

    pub fn as_valid(&self) -> Option<&MessageUnboxedValid> {
        match self {
            UnboxedMessage::Valid(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&MessageUnboxedError> {
        match self {
            UnboxedMessage::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_outbox(&self) -> Option<&OutboxRecord> {
        match self {
            UnboxedMessage::Outbox(r) => Some(r),
            _ => None,
        }
    }

    /// `Outbox → Valid`: the server confirmed the queued send.
    ///
    /// `confirmed` must be `Valid` and carry this record's outbox id in its
    /// signed header.
    pub fn confirm_outbox(self, confirmed: UnboxedMessage) -> Result<UnboxedMessage, ProtoError> {
        let record = match self {
            UnboxedMessage::Outbox(record) => record,
            other => {
                return Err(ProtoError::InvalidTransition(format!(
                    "confirm_outbox on a {} message",
                    other.state().as_str()
                )))
            }
        };
        let valid = match confirmed {
            UnboxedMessage::Valid(valid) => valid,
            other => {
                return Err(ProtoError::InvalidTransition(format!(
                    "outbox {} confirmed by a {} message",
                    record.outbox_id,
                    other.state().as_str()
                )))
            }
        };
        match valid.client_header.outbox_id.as_ref() {
            Some(id) if *id == record.outbox_id => Ok(UnboxedMessage::Valid(valid)),
            other => Err(ProtoError::InvalidTransition(format!(
                "outbox {} confirmed by message carrying outbox {:?}",
                record.outbox_id, other
            ))),
        }
    }

    /// `Placeholder → Valid | Error`: a background fetch resolved the id.
    pub fn resolve_placeholder(self, fetched: UnboxedMessage) -> Result<UnboxedMessage, ProtoError> {
        let placeholder = match self {
            UnboxedMessage::Placeholder(placeholder) => placeholder,
            other => {
                return Err(ProtoError::InvalidTransition(format!(
                    "resolve_placeholder on a {} message",
                    other.state().as_str()
                )))
            }
        };
        match &fetched {
            UnboxedMessage::Valid(_) | UnboxedMessage::Error(_) => {}
            other => {
                return Err(ProtoError::InvalidTransition(format!(
                    "placeholder {} resolved to a {} message",
                    placeholder.message_id,
                    other.state().as_str()
                )))
            }
        }
        if fetched.message_id() != placeholder.message_id {
            return Err(ProtoError::InvalidTransition(format!(
                "placeholder {} resolved to message {}",
                placeholder.message_id,
                fetched.message_id()
            )));
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::plaintext;

    fn valid(id: u64, outbox_id: Option<OutboxId>) -> UnboxedMessage {
        let mut msg = plaintext("hi");
        msg.client_header.outbox_id = outbox_id;
        UnboxedMessage::Valid(Box::new(MessageUnboxedValid {
            server_header: Some(ServerHeader {
                message_id: MessageId(id),
                superseded_by: MessageId::NONE,
                ctime: Utc::now(),
                rtime: None,
            }),
            client_header: msg.client_header,
            body: msg.body,
            header_hash: vec![1; 32],
            body_hash: vec![2; 32],
            verify_key: vec![3; 32],
            key_generation: 1,
            at_mentions: vec![],
            sender_device_revoked_at: None,
        }))
    }

    fn error(id: u64, kind: UnboxErrorKind) -> UnboxedMessage {
        UnboxedMessage::Error(Box::new(MessageUnboxedError {
            kind,
            message: "nope".into(),
            recoverable: false,
            version_error: None,
            message_id: MessageId(id),
            message_type: MessageType::Text,
            ctime: None,
            sender: UserId::new(vec![1]),
            sender_device: DeviceId::new(vec![2]),
            is_ephemeral: false,
            outbox_id: None,
        }))
    }

    fn outbox() -> OutboxRecord {
        let msg = plaintext("pending");
        let conv = msg.client_header.conv.conversation_id();
        OutboxRecord::new(conv, OutboxId::generate(), msg, 3, Utc::now())
    }

    #[test]
    fn accessors_are_neutral_for_non_server_states() {
        let ob = UnboxedMessage::Outbox(Box::new(outbox()));
        assert_eq!(ob.message_id(), MessageId::NONE);
        assert_eq!(ob.message_type(), MessageType::None);
        assert_eq!(ob.ordinal(), Some(3));

        let ph = UnboxedMessage::Placeholder(MessageUnboxedPlaceholder {
            message_id: MessageId(5),
            hidden: false,
        });
        assert_eq!(ph.message_id(), MessageId::NONE);

        let err = error(9, UnboxErrorKind::Misc);
        assert_eq!(err.message_id(), MessageId(9));
        assert_eq!(err.message_type(), MessageType::Text);
    }

    #[test]
    fn critical_version_errors_are_hidden() {
        assert!(!error(1, UnboxErrorKind::BadVersionCritical).is_visible());
        assert!(error(1, UnboxErrorKind::BadVersion).is_visible());
    }

    #[test]
    fn outbox_confirms_only_with_matching_outbox_id() {
        let rec = outbox();
        let id = rec.outbox_id.clone();
        let ok = UnboxedMessage::Outbox(Box::new(rec.clone()))
            .confirm_outbox(valid(10, Some(id)))
            .unwrap();
        assert_eq!(ok.message_id(), MessageId(10));

        let wrong = UnboxedMessage::Outbox(Box::new(rec))
            .confirm_outbox(valid(11, Some(OutboxId::generate())));
        assert!(matches!(wrong, Err(ProtoError::InvalidTransition(_))));
    }

    #[test]
    fn placeholder_resolves_to_same_id() {
        let ph = || {
            UnboxedMessage::Placeholder(MessageUnboxedPlaceholder {
                message_id: MessageId(4),
                hidden: false,
            })
        };
        assert!(ph().resolve_placeholder(valid(4, None)).unwrap().is_valid());
        assert_eq!(
            ph().resolve_placeholder(error(4, UnboxErrorKind::Identify)).unwrap().state(),
            MessageState::Error
        );
        assert!(ph().resolve_placeholder(valid(5, None)).is_err());
        assert!(valid(4, None).resolve_placeholder(valid(4, None)).is_err());
    }

    #[test]
    fn version_error_parseability() {
        let old = VersionError { kind: VersionKind::Body, version: 1 };
        let new = VersionError { kind: VersionKind::Body, version: 2 };
        assert!(old.is_now_parseable());
        assert!(!new.is_now_parseable());
    }
}
