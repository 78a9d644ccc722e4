//! Persistent inbox cache.
//!
//! Conversation data and the inbox version counter are written in the same
//! SQLite transaction, so after a crash the version never describes data that
//! did not land (and vice versa). Writers are serialised by one lock.

use std::sync::Arc;

use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use chat_proto::ids::ConversationId;
use chat_proto::ProtoError;
use chat_proto::sync::{
    check_push_version, plan, Conversation, InboxSnapshot, InboxVersion, PushDisposition, SyncAction,
    SyncResult,
};

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{ConversationRow, InboxStateRow};

/// What an applied sync result changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Unchanged,
    Upserted { version: InboxVersion, conversations: usize },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct InboxStatus {
    pub version: InboxVersion,
    pub needs_refetch: bool,
    pub conversations: usize,
}

#[derive(Clone)]
pub struct Inbox {
    store: Store,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Inbox {
    pub fn new(store: Store) -> Self {
        Self { store, write_lock: Arc::new(tokio::sync::Mutex::new(())) }
    }

    async fn state_row(&self) -> Result<InboxStateRow, StoreError> {
        Ok(sqlx::query_as::<_, InboxStateRow>("SELECT version, needs_refetch FROM inbox_state WHERE id = 1")
            .fetch_one(&self.store.pool)
            .await?)
    }

    pub async fn version(&self) -> Result<InboxVersion, StoreError> {
        Ok(InboxVersion(self.state_row().await?.version as u64))
    }

    pub async fn status(&self) -> Result<InboxStatus, StoreError> {
        let state = self.state_row().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.store.pool)
            .await?;
        Ok(InboxStatus {
            version: InboxVersion(state.version as u64),
            needs_refetch: state.needs_refetch,
            conversations: count as usize,
        })
    }

    pub async fn get(&self, conv_id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT conv_id, data, max_msg_id, mtime FROM conversations WHERE conv_id = ?",
        )
        .bind(conv_id.to_hex())
        .fetch_optional(&self.store.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(serde_json::from_str(&r.data)?)),
            None => Ok(None),
        }
    }

    /// Cached conversations, most recently modified first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT conv_id, data, max_msg_id, mtime FROM conversations ORDER BY mtime DESC, conv_id",
        )
        .fetch_all(&self.store.pool)
        .await?;
        rows.iter()
            .map(|r| serde_json::from_str(&r.data).map_err(StoreError::from))
            .collect()
    }

    /// Version, flag and data read in one transaction.
    pub async fn snapshot(&self) -> Result<InboxSnapshot, StoreError> {
        let mut tx = self.store.pool.begin().await?;
        let state = sqlx::query_as::<_, InboxStateRow>("SELECT version, needs_refetch FROM inbox_state WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;
        let rows = sqlx::query_as::<_, ConversationRow>("SELECT conv_id, data, max_msg_id, mtime FROM conversations")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut snapshot = InboxSnapshot {
            version: InboxVersion(state.version as u64),
            needs_refetch: state.needs_refetch,
            ..InboxSnapshot::default()
        };
        for row in rows {
            let conv: Conversation = serde_json::from_str(&row.data)?;
            snapshot.conversations.insert(conv.id.clone(), conv);
        }
        Ok(snapshot)
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    async fn stage_conversations(
        tx: &mut Transaction<'_, Sqlite>,
        conversations: &[Conversation],
    ) -> Result<(), StoreError> {
        for conv in conversations {
            sqlx::query(
                "INSERT INTO conversations (conv_id, data, max_msg_id, mtime) VALUES (?, ?, ?, ?)
                 ON CONFLICT(conv_id) DO UPDATE SET
                    data = excluded.data, max_msg_id = excluded.max_msg_id, mtime = excluded.mtime",
            )
            .bind(conv.id.to_hex())
            .bind(serde_json::to_string(conv)?)
            .bind(conv.max_msg_id.0 as i64)
            .bind(conv.mtime)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn stage_version(
        tx: &mut Transaction<'_, Sqlite>,
        version: InboxVersion,
        needs_refetch: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE inbox_state SET version = ?, needs_refetch = ? WHERE id = 1")
            .bind(version.0 as i64)
            .bind(needs_refetch)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Apply whichever sync result the server sent.
    pub async fn apply_sync(&self, result: SyncResult) -> Result<ApplyOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let local = self.version().await?;
        let kind = result.as_str();

        match plan(local, result) {
            SyncAction::None => {
                debug!(%local, kind, "inbox sync: nothing to apply");
                Ok(ApplyOutcome::Unchanged)
            }
            SyncAction::Upsert { version, conversations } => {
                let mut tx = self.store.pool.begin().await?;
                Self::stage_conversations(&mut tx, &conversations).await?;
                Self::stage_version(&mut tx, version, false).await?;
                tx.commit().await?;
                info!(from = %local, to = %version, changed = conversations.len(), "applied incremental inbox sync");
                Ok(ApplyOutcome::Upserted { version, conversations: conversations.len() })
            }
            SyncAction::Clear => {
                let mut tx = self.store.pool.begin().await?;
                sqlx::query("DELETE FROM conversations").execute(&mut *tx).await?;
                Self::stage_version(&mut tx, InboxVersion::ZERO, true).await?;
                tx.commit().await?;
                warn!(from = %local, "inbox cleared; full refetch required");
                Ok(ApplyOutcome::Cleared)
            }
        }
    }

    /// Replace the cache with a full listing and set its version.
    pub async fn complete_refetch(
        &self,
        version: InboxVersion,
        conversations: &[Conversation],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.store.pool.begin().await?;
        sqlx::query("DELETE FROM conversations").execute(&mut *tx).await?;
        Self::stage_conversations(&mut tx, conversations).await?;
        Self::stage_version(&mut tx, version, false).await?;
        tx.commit().await?;
        info!(%version, conversations = conversations.len(), "inbox refetched");
        Ok(())
    }

    /// Apply a pushed change. A version gap surfaces as
    /// `ProtoError::VersionMismatch`; the caller answers it with a full sync.
    ///
    /// While a refetch is outstanding only self-updates are applied: the
    /// cache is partial and its version must not move until the refetch
    /// completes.
    pub async fn apply_push(
        &self,
        version: InboxVersion,
        conversations: &[Conversation],
    ) -> Result<PushDisposition, StoreError> {
        let _guard = self.write_lock.lock().await;
        let state = self.state_row().await?;
        let local = InboxVersion(state.version as u64);
        let disposition = check_push_version(local, version)?;
        if state.needs_refetch && disposition != PushDisposition::SelfUpdate {
            debug!(%version, "inbox push deferred until refetch completes");
            return Err(ProtoError::VersionMismatch { local: local.0, remote: version.0 }.into());
        }
        match disposition {
            PushDisposition::Stale => {
                debug!(%local, %version, "stale inbox push ignored");
            }
            PushDisposition::SelfUpdate => {
                let mut tx = self.store.pool.begin().await?;
                Self::stage_conversations(&mut tx, conversations).await?;
                tx.commit().await?;
            }
            PushDisposition::Apply => {
                let mut tx = self.store.pool.begin().await?;
                Self::stage_conversations(&mut tx, conversations).await?;
                Self::stage_version(&mut tx, version, false).await?;
                tx.commit().await?;
            }
        }
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_unlocked;
    use chat_proto::header::{ConversationTriple, TopicType};
    use chat_proto::ids::{MessageId, TlfId, TopicId};
    use chat_proto::sync::ConversationStatus;
    use chrono::{DateTime, Utc};

    fn conv(tag: u8, max: u64) -> Conversation {
        let triple = ConversationTriple {
            tlf_id: TlfId::new(vec![tag]),
            topic_id: TopicId::new(vec![tag]),
            topic_type: TopicType::Chat,
        };
        Conversation {
            id: triple.conversation_id(),
            triple,
            tlf_name: format!("c{tag}"),
            status: ConversationStatus::Unfiled,
            max_msg_id: MessageId(max),
            read_msg_id: MessageId::NONE,
            mtime: DateTime::<Utc>::from_timestamp(1_700_000_000 + i64::from(tag), 0).unwrap_or_default(),
            members: vec![],
        }
    }

    async fn inbox_at_10(dir: &tempfile::TempDir) -> Inbox {
        let inbox = Inbox::new(open_unlocked(dir).await);
        inbox
            .complete_refetch(InboxVersion(10), &[conv(1, 5), conv(2, 7)])
            .await
            .unwrap();
        inbox
    }

    #[tokio::test]
    async fn incremental_updates_only_listed_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = inbox_at_10(&dir).await;
        let y_before = inbox.get(&conv(2, 7).id).await.unwrap();

        let x = conv(1, 9);
        let outcome = inbox
            .apply_sync(SyncResult::Incremental { version: InboxVersion(12), conversations: vec![x.clone()] })
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted { version: InboxVersion(12), conversations: 1 });
        assert_eq!(inbox.version().await.unwrap(), InboxVersion(12));
        assert_eq!(inbox.get(&x.id).await.unwrap(), Some(x));
        assert_eq!(inbox.get(&conv(2, 7).id).await.unwrap(), y_before);
    }

    #[tokio::test]
    async fn replayed_incremental_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = inbox_at_10(&dir).await;
        let result = SyncResult::Incremental { version: InboxVersion(11), conversations: vec![conv(3, 1)] };
        inbox.apply_sync(result.clone()).await.unwrap();
        let once = inbox.snapshot().await.unwrap();
        assert_eq!(inbox.apply_sync(result).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(inbox.snapshot().await.unwrap(), once);
    }

    #[tokio::test]
    async fn crash_before_commit_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let before = {
            let inbox = inbox_at_10(&dir).await;
            let before = inbox.snapshot().await.unwrap();

            // Data staged, process dies before the version moves and commit.
            let mut tx = inbox.store.pool.begin().await.unwrap();
            Inbox::stage_conversations(&mut tx, &[conv(1, 99), conv(4, 1)]).await.unwrap();
            drop(tx);

            // Both staged, still no commit.
            let mut tx = inbox.store.pool.begin().await.unwrap();
            Inbox::stage_conversations(&mut tx, &[conv(1, 99)]).await.unwrap();
            Inbox::stage_version(&mut tx, InboxVersion(11), false).await.unwrap();
            drop(tx);
            inbox.store.pool.close().await;
            before
        };

        let recovered = Inbox::new(open_unlocked(&dir).await);
        assert_eq!(recovered.snapshot().await.unwrap(), before);
    }

    #[tokio::test]
    async fn clear_then_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = inbox_at_10(&dir).await;
        assert_eq!(inbox.apply_sync(SyncResult::Clear).await.unwrap(), ApplyOutcome::Cleared);
        let status = inbox.status().await.unwrap();
        assert_eq!(status, InboxStatus { version: InboxVersion::ZERO, needs_refetch: true, conversations: 0 });

        inbox.complete_refetch(InboxVersion(30), &[conv(5, 1)]).await.unwrap();
        let status = inbox.status().await.unwrap();
        assert_eq!(status, InboxStatus { version: InboxVersion(30), needs_refetch: false, conversations: 1 });
    }

    #[tokio::test]
    async fn push_updates_respect_version_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = inbox_at_10(&dir).await;

        assert_eq!(
            inbox.apply_push(InboxVersion(11), &[conv(1, 6)]).await.unwrap(),
            PushDisposition::Apply
        );
        assert_eq!(inbox.version().await.unwrap(), InboxVersion(11));

        assert_eq!(
            inbox.apply_push(InboxVersion(0), &[conv(2, 8)]).await.unwrap(),
            PushDisposition::SelfUpdate
        );
        assert_eq!(inbox.version().await.unwrap(), InboxVersion(11));
        assert_eq!(inbox.get(&conv(2, 8).id).await.unwrap().unwrap().max_msg_id, MessageId(8));

        assert_eq!(
            inbox.apply_push(InboxVersion(9), &[conv(1, 1)]).await.unwrap(),
            PushDisposition::Stale
        );
        assert_eq!(inbox.get(&conv(1, 6).id).await.unwrap().unwrap().max_msg_id, MessageId(6));

        let gap = inbox.apply_push(InboxVersion(15), &[conv(1, 2)]).await;
        assert!(matches!(gap, Err(StoreError::Proto(ProtoError::VersionMismatch { .. }))));
    }

    #[tokio::test]
    async fn pending_refetch_only_takes_self_updates() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = inbox_at_10(&dir).await;
        inbox.apply_sync(SyncResult::Clear).await.unwrap();

        let next = inbox.apply_push(InboxVersion(1), &[conv(1, 3)]).await;
        assert!(matches!(next, Err(StoreError::Proto(ProtoError::VersionMismatch { local: 0, remote: 1 }))));
        let status = inbox.status().await.unwrap();
        assert!(status.needs_refetch);
        assert_eq!(status.conversations, 0);

        assert_eq!(
            inbox.apply_push(InboxVersion(0), &[conv(2, 4)]).await.unwrap(),
            PushDisposition::SelfUpdate
        );
        let status = inbox.status().await.unwrap();
        assert_eq!(status, InboxStatus { version: InboxVersion::ZERO, needs_refetch: true, conversations: 1 });
    }
}
