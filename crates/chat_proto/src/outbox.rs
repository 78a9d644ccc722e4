//! Outbox records: locally composed messages the server has not confirmed.
//!
//! The record carries its own state machine:
//!
//! ```text
//!   enqueue ──► Sending{0} ──attempt──► Sending{n+1} ──confirm──► (removed)
//!                   │  ▲                    │
//!                   │  └──── retry ─────────┤
//!                   ▼                       ▼
//!             Error{kind} ◄─────────────────┘
//! ```
//!
//! Whether a failed record may go back to `Sending` is decided by its error
//! kind (`OutboxErrorKind::retry_policy`). Persistence and per-conversation
//! serialisation live in `chat_store::outbox`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::ids::{hex_bytes, ConversationId, MessageId, OutboxId};
use crate::message::MessagePlaintext;
use crate::unboxed::UnboxedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxErrorKind {
    Misc,
    Offline,
    Identify,
    TooLong,
    Duplicate,
    Expired,
    TooManyAttempts,
    AlreadyDeleted,
    UploadFailed,
    RestrictedBot,
    MinWriter,
}

/// What `retry` is allowed to do with a record failed with a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Reset to `Sending` and try again.
    Retryable,
    /// Recipient identities must be re-resolved before the record may retry.
    RequiresIdentify,
    /// The server will never accept this record; retry is rejected.
    Terminal,
}

impl OutboxErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxErrorKind::Misc => "misc",
            OutboxErrorKind::Offline => "offline",
            OutboxErrorKind::Identify => "identify",
            OutboxErrorKind::TooLong => "too_long",
            OutboxErrorKind::Duplicate => "duplicate",
            OutboxErrorKind::Expired => "expired",
            OutboxErrorKind::TooManyAttempts => "too_many_attempts",
            OutboxErrorKind::AlreadyDeleted => "already_deleted",
            OutboxErrorKind::UploadFailed => "upload_failed",
            OutboxErrorKind::RestrictedBot => "restricted_bot",
            OutboxErrorKind::MinWriter => "min_writer",
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            OutboxErrorKind::Misc
            | OutboxErrorKind::Offline
            | OutboxErrorKind::Expired
            | OutboxErrorKind::TooManyAttempts
            | OutboxErrorKind::UploadFailed => RetryPolicy::Retryable,
            OutboxErrorKind::Identify => RetryPolicy::RequiresIdentify,
            OutboxErrorKind::TooLong
            | OutboxErrorKind::Duplicate
            | OutboxErrorKind::AlreadyDeleted
            | OutboxErrorKind::RestrictedBot
            | OutboxErrorKind::MinWriter => RetryPolicy::Terminal,
        }
    }

    /// Failures worth surfacing to the user as an unread badge.
    pub fn is_badgable(&self) -> bool {
        matches!(
            self,
            OutboxErrorKind::Misc
                | OutboxErrorKind::Offline
                | OutboxErrorKind::TooLong
                | OutboxErrorKind::Expired
                | OutboxErrorKind::TooManyAttempts
                | OutboxErrorKind::UploadFailed
        )
    }
}

impl fmt::Display for OutboxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutboxState {
    /// Waiting for (or in) a send; `attempts` counts started attempts.
    Sending { attempts: u32 },
    Error { kind: OutboxErrorKind, message: String },
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxState::Sending { .. } => "sending",
            OutboxState::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentifyBehavior {
    #[default]
    Default,
    /// Interactive client: identity breaks are surfaced, not fatal.
    ChatGui,
    /// Non-interactive client: any identity break fails the send.
    ChatCli,
    /// Identities were resolved out of band for this send.
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrepareOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_target: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SendOptions {
    /// Make the message exploding with this lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_lifetime_secs: Option<u64>,
    #[serde(default)]
    pub join_mentions: bool,
}

/// Locally generated preview for a pending attachment upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPreview {
    pub mime_type: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub state: OutboxState,
    pub outbox_id: OutboxId,
    pub conv_id: ConversationId,
    pub ctime: DateTime<Utc>,
    pub msg: MessagePlaintext,
    #[serde(default)]
    pub identify_behavior: IdentifyBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_opts: Option<PrepareOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_opts: Option<SendOptions>,
    /// Position among this conversation's pending records.
    pub ordinal: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<AttachmentPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Box<UnboxedMessage>>,
    /// Bumped on every retry; a server response for an older epoch is stale.
    #[serde(default)]
    pub send_epoch: u64,
}

impl OutboxRecord {
    /// A fresh record in `Sending{0}`. The header's outbox linkage is set to
    /// `outbox_id` so the confirmed message can be matched back.
    pub fn new(
        conv_id: ConversationId,
        outbox_id: OutboxId,
        mut msg: MessagePlaintext,
        ordinal: u64,
        now: DateTime<Utc>,
    ) -> Self {
        msg.client_header.outbox_id = Some(outbox_id.clone());
        Self {
            state: OutboxState::Sending { attempts: 0 },
            outbox_id,
            conv_id,
            ctime: now,
            msg,
            identify_behavior: IdentifyBehavior::default(),
            prepare_opts: None,
            send_opts: None,
            ordinal,
            preview: None,
            reply_to: None,
            send_epoch: 0,
        }
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.state, OutboxState::Sending { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, OutboxState::Error { .. })
    }

    pub fn error_kind(&self) -> Option<OutboxErrorKind> {
        match &self.state {
            OutboxState::Error { kind, .. } => Some(*kind),
            OutboxState::Sending { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self.state {
            OutboxState::Sending { attempts } => attempts,
            OutboxState::Error { .. } => 0,
        }
    }

    /// Last server message id this record expects to follow.
    pub fn client_prev(&self) -> MessageId {
        self.msg
            .client_header
            .outbox_info
            .as_ref()
            .map(|i| i.prev)
            .unwrap_or(MessageId::NONE)
    }

    pub fn set_client_prev(&mut self, prev: MessageId) {
        match self.msg.client_header.outbox_info.as_mut() {
            Some(info) => info.prev = prev,
            None => {
                self.msg.client_header.outbox_info = Some(crate::header::OutboxInfo {
                    prev,
                    compose_time: self.ctime,
                })
            }
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.msg.client_header.is_ephemeral()
            || self
                .send_opts
                .as_ref()
                .is_some_and(|o| o.ephemeral_lifetime_secs.is_some())
    }

    /// Start a send attempt. Only valid while `Sending`.
    pub fn record_attempt(&mut self) -> Result<u32, ProtoError> {
        match &mut self.state {
            OutboxState::Sending { attempts } => {
                *attempts += 1;
                Ok(*attempts)
            }
            OutboxState::Error { kind, .. } => Err(ProtoError::InvalidTransition(format!(
                "outbox {} is in error state ({kind}); retry before sending",
                self.outbox_id
            ))),
        }
    }

    pub fn fail(&mut self, kind: OutboxErrorKind, message: impl Into<String>) {
        self.state = OutboxState::Error { kind, message: message.into() };
    }

    /// Put a failed record back into `Sending{0}`.
    ///
    /// Returns `Ok(false)` when the record is already sending (nothing to do).
    /// `identify` must be supplied for records that failed identity checks.
    pub fn reset_for_retry(
        &mut self,
        now: DateTime<Utc>,
        identify: Option<IdentifyBehavior>,
    ) -> Result<bool, ProtoError> {
        let kind = match &self.state {
            OutboxState::Sending { .. } => return Ok(false),
            OutboxState::Error { kind, .. } => *kind,
        };
        match kind.retry_policy() {
            RetryPolicy::Terminal => {
                return Err(ProtoError::RetryRejected { outbox_id: self.outbox_id.clone(), kind })
            }
            RetryPolicy::RequiresIdentify if identify.is_none() => {
                return Err(ProtoError::IdentifyRequired(self.outbox_id.clone()))
            }
            RetryPolicy::RequiresIdentify | RetryPolicy::Retryable => {}
        }
        if let Some(behavior) = identify {
            self.identify_behavior = behavior;
        }
        self.state = OutboxState::Sending { attempts: 0 };
        self.ctime = now;
        self.send_epoch += 1;
        Ok(true)
    }
}
