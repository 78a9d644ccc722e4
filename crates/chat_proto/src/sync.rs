//! Inbox synchronisation types and the pure reconciliation routine.
//!
//! The server decides which `SyncResult` variant to send; the client only
//! applies it. `plan` turns (local version, result) into the write the
//! persistence layer must commit atomically, and `InboxSnapshot::apply` is the
//! in-memory application of the same plan.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::header::ConversationTriple;
use crate::ids::{ConversationId, MessageId, UserId};

/// Per-user monotonically increasing inbox counter. `0` means "never synced".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboxVersion(pub u64);

impl InboxVersion {
    pub const ZERO: InboxVersion = InboxVersion(0);

    pub fn next(self) -> InboxVersion {
        InboxVersion(self.0 + 1)
    }
}

impl fmt::Display for InboxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Unfiled,
    Favorite,
    Ignored,
    Blocked,
    Muted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Unfiled => "unfiled",
            ConversationStatus::Favorite => "favorite",
            ConversationStatus::Ignored => "ignored",
            ConversationStatus::Blocked => "blocked",
            ConversationStatus::Muted => "muted",
        }
    }
}

/// One inbox entry as the server describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub triple: ConversationTriple,
    pub tlf_name: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub max_msg_id: MessageId,
    #[serde(default)]
    pub read_msg_id: MessageId,
    pub mtime: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sync", rename_all = "snake_case")]
pub enum SyncResult {
    Current,
    Incremental {
        version: InboxVersion,
        conversations: Vec<Conversation>,
    },
    Clear,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Current => "current",
            SyncResult::Incremental { .. } => "incremental",
            SyncResult::Clear => "clear",
        }
    }
}

/// The local write a sync result calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing to write.
    None,
    /// Upsert these conversations and set the version, in one commit.
    Upsert {
        version: InboxVersion,
        conversations: Vec<Conversation>,
    },
    /// Drop the cache, reset the version to zero and flag a full refetch.
    Clear,
}

/// Decide what `result` means for a local inbox at `local`.
///
/// An incremental result at or below the local version has already been
/// applied, so replaying it is a no-op.
pub fn plan(local: InboxVersion, result: SyncResult) -> SyncAction {
    match result {
        SyncResult::Current => SyncAction::None,
        SyncResult::Incremental { version, .. } if version <= local => SyncAction::None,
        SyncResult::Incremental { version, conversations } => SyncAction::Upsert { version, conversations },
        SyncResult::Clear => SyncAction::Clear,
    }
}

/// How a pushed inbox update relates to the local version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Version 0: a change made by this client; apply without moving the version.
    SelfUpdate,
    /// Already covered by the local version; ignore.
    Stale,
    /// Exactly the next version; apply and advance.
    Apply,
}

/// Anything other than self-update, stale or next-in-sequence is a gap the
/// caller must close with a full sync.
pub fn check_push_version(local: InboxVersion, update: InboxVersion) -> Result<PushDisposition, ProtoError> {
    if update == InboxVersion::ZERO {
        Ok(PushDisposition::SelfUpdate)
    } else if update <= local {
        Ok(PushDisposition::Stale)
    } else if update == local.next() {
        Ok(PushDisposition::Apply)
    } else {
        Err(ProtoError::VersionMismatch { local: local.0, remote: update.0 })
    }
}

/// In-memory local inbox state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboxSnapshot {
    pub version: InboxVersion,
    pub conversations: BTreeMap<ConversationId, Conversation>,
    #[serde(default)]
    pub needs_refetch: bool,
}

impl InboxSnapshot {
    /// `applySyncResult(local, result) -> new local state`.
    pub fn apply(&self, result: SyncResult) -> InboxSnapshot {
        let mut next = self.clone();
        match plan(self.version, result) {
            SyncAction::None => {}
            SyncAction::Upsert { version, conversations } => {
                for conv in conversations {
                    next.conversations.insert(conv.id.clone(), conv);
                }
                next.version = version;
            }
            SyncAction::Clear => {
                next.conversations.clear();
                next.version = InboxVersion::ZERO;
                next.needs_refetch = true;
            }
        }
        next
    }

    /// Finish a refetch after `Clear`: the full list and its version land together.
    pub fn complete_refetch(&self, version: InboxVersion, conversations: Vec<Conversation>) -> InboxSnapshot {
        InboxSnapshot {
            version,
            conversations: conversations.into_iter().map(|c| (c.id.clone(), c)).collect(),
            needs_refetch: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::TopicType;
    use crate::ids::{TlfId, TopicId};

    fn conv(tag: u8, max: u64) -> Conversation {
        let triple = ConversationTriple {
            tlf_id: TlfId::new(vec![tag]),
            topic_id: TopicId::new(vec![tag, tag]),
            topic_type: TopicType::Chat,
        };
        Conversation {
            id: triple.conversation_id(),
            triple,
            tlf_name: format!("conv{tag}"),
            status: ConversationStatus::Unfiled,
            max_msg_id: MessageId(max),
            read_msg_id: MessageId::NONE,
            mtime: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            members: vec![],
        }
    }

    fn snapshot_at_10() -> InboxSnapshot {
        InboxSnapshot::default().complete_refetch(InboxVersion(10), vec![conv(1, 5), conv(2, 7)])
    }

    #[test]
    fn incremental_touches_only_listed_conversations() {
        let before = snapshot_at_10();
        let x = conv(1, 9);
        let after = before.apply(SyncResult::Incremental {
            version: InboxVersion(12),
            conversations: vec![x.clone()],
        });
        assert_eq!(after.version, InboxVersion(12));
        assert_eq!(after.conversations[&x.id], x);
        let y = conv(2, 7);
        assert_eq!(after.conversations[&y.id], before.conversations[&y.id]);
    }

    #[test]
    fn replaying_incremental_is_idempotent() {
        let result = SyncResult::Incremental { version: InboxVersion(11), conversations: vec![conv(3, 1)] };
        let once = snapshot_at_10().apply(result.clone());
        let twice = once.apply(result);
        assert_eq!(once, twice);
    }

    #[test]
    fn current_is_a_noop_and_clear_resets() {
        let before = snapshot_at_10();
        assert_eq!(before.apply(SyncResult::Current), before);

        let cleared = before.apply(SyncResult::Clear);
        assert!(cleared.conversations.is_empty());
        assert_eq!(cleared.version, InboxVersion::ZERO);
        assert!(cleared.needs_refetch);

        let refetched = cleared.complete_refetch(InboxVersion(20), vec![conv(4, 2)]);
        assert!(!refetched.needs_refetch);
        assert_eq!(refetched.version, InboxVersion(20));
    }

    #[test]
    fn push_versions() {
        let local = InboxVersion(10);
        assert_eq!(check_push_version(local, InboxVersion(0)).unwrap(), PushDisposition::SelfUpdate);
        assert_eq!(check_push_version(local, InboxVersion(9)).unwrap(), PushDisposition::Stale);
        assert_eq!(check_push_version(local, InboxVersion(10)).unwrap(), PushDisposition::Stale);
        assert_eq!(check_push_version(local, InboxVersion(11)).unwrap(), PushDisposition::Apply);
        assert!(matches!(
            check_push_version(local, InboxVersion(13)),
            Err(ProtoError::VersionMismatch { local: 10, remote: 13 })
        ));
    }
}
