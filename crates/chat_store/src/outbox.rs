//! Persistent outbox.
//!
//! Records survive restarts and are vault-encrypted at rest. All mutations of
//! one conversation's records are serialised through a per-conversation async
//! lock, which keeps ordinal allocation strictly increasing; different
//! conversations proceed concurrently.
//!
//! Late server responses are matched by `(outbox_id, send_epoch)`: a record
//! that was cancelled is gone, and a record that was retried has a newer
//! epoch, so either way the response is dropped instead of resurrecting it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use chat_proto::ids::{ConversationId, MessageId, OutboxId};
use chat_proto::message::MessagePlaintext;
use chat_proto::outbox::{
    AttachmentPreview, IdentifyBehavior, OutboxErrorKind, OutboxRecord, PrepareOptions, SendOptions,
};
use chat_proto::thread::ThreadView;
use chat_proto::unboxed::UnboxedMessage;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::OutboxRow;

/// Everything besides the message that goes into a new record.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Reuse an id (e.g. derived from the draft); generated when `None`.
    pub outbox_id: Option<OutboxId>,
    /// Newest server message the composer had seen.
    pub client_prev: MessageId,
    pub identify: IdentifyBehavior,
    pub prepare: Option<PrepareOptions>,
    pub send: Option<SendOptions>,
    pub preview: Option<AttachmentPreview>,
    pub reply_to: Option<UnboxedMessage>,
}

/// Result of applying a server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Removed(OutboxRecord),
    /// The record was retried since this send started.
    Stale { current_epoch: u64 },
    /// The record was cancelled or already confirmed.
    Missing,
}

/// Result of applying a failed send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Failed(OutboxRecord),
    /// The record was retried since this send started; it keeps its new attempt.
    Stale { current_epoch: u64 },
    Missing,
}

#[derive(Clone)]
pub struct Outbox {
    store: Store,
    conv_locks: Arc<Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>>,
}

const OUTBOX_COLUMNS: &str =
    "outbox_id, conv_id, ordinal, state, error_kind, ephemeral, send_epoch, ctime, record_enc";

impl Outbox {
    pub fn new(store: Store) -> Self {
        Self { store, conv_locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn conv_lock(&self, conv_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        self.conv_locks
            .lock()
            .entry(conv_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── Row codec ────────────────────────────────────────────────────────────

    async fn encrypt_record(&self, record: &OutboxRecord) -> Result<String, StoreError> {
        let json = zeroize::Zeroizing::new(serde_json::to_vec(record)?);
        self.store
            .encrypt_value(&json, record.outbox_id.to_hex().as_bytes())
            .await
    }

    async fn decode(&self, row: &OutboxRow) -> Result<OutboxRecord, StoreError> {
        let json = zeroize::Zeroizing::new(
            self.store
                .decrypt_value(&row.record_enc, row.outbox_id.as_bytes())
                .await?,
        );
        Ok(serde_json::from_slice(&json)?)
    }

    async fn decode_all(&self, rows: Vec<OutboxRow>) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.decode(row).await?);
        }
        Ok(out)
    }

    async fn fetch_row(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRow>, StoreError> {
        Ok(sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE outbox_id = ?"
        ))
        .bind(outbox_id.to_hex())
        .fetch_optional(&self.store.pool)
        .await?)
    }

    async fn load(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        match self.fetch_row(outbox_id).await? {
            Some(row) => Ok(Some(self.decode(&row).await?)),
            None => Ok(None),
        }
    }

    /// Rewrite an existing row. A row that has been deleted stays deleted.
    async fn save(&self, record: &OutboxRecord) -> Result<bool, StoreError> {
        let record_enc = self.encrypt_record(record).await?;
        let updated = sqlx::query(
            "UPDATE outbox SET state = ?, error_kind = ?, ephemeral = ?, send_epoch = ?, ctime = ?, record_enc = ?
             WHERE outbox_id = ?",
        )
        .bind(record.state.as_str())
        .bind(record.error_kind().map(|k| k.as_str()))
        .bind(record.is_ephemeral())
        .bind(record.send_epoch as i64)
        .bind(record.ctime)
        .bind(record_enc)
        .bind(record.outbox_id.to_hex())
        .execute(&self.store.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    /// Load, mutate and save one record under its conversation lock.
    /// `Ok(None)` when the record does not exist.
    async fn update<F, T>(&self, outbox_id: &OutboxId, f: F) -> Result<Option<(OutboxRecord, T)>, StoreError>
    where
        F: FnOnce(&mut OutboxRecord) -> Result<T, StoreError>,
    {
        let Some(row) = self.fetch_row(outbox_id).await? else {
            return Ok(None);
        };
        let conv_id = ConversationId::from_hex(&row.conv_id)?;
        let lock = self.conv_lock(&conv_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(outbox_id).await? else {
            return Ok(None);
        };
        let out = f(&mut record)?;
        if !self.save(&record).await? {
            return Ok(None);
        }
        Ok(Some((record, out)))
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Queue a message. The record gets the next ordinal of its conversation.
    pub async fn enqueue(
        &self,
        conv_id: &ConversationId,
        msg: MessagePlaintext,
        opts: EnqueueOptions,
    ) -> Result<OutboxRecord, StoreError> {
        let lock = self.conv_lock(conv_id);
        let _guard = lock.lock().await;

        let mut tx = self.store.pool.begin().await?;
        let next: Option<i64> =
            sqlx::query_scalar("SELECT next_ordinal FROM outbox_ordinals WHERE conv_id = ?")
                .bind(conv_id.to_hex())
                .fetch_optional(&mut *tx)
                .await?;
        let ordinal = next.unwrap_or(1);
        sqlx::query(
            "INSERT INTO outbox_ordinals (conv_id, next_ordinal) VALUES (?, ?)
             ON CONFLICT(conv_id) DO UPDATE SET next_ordinal = excluded.next_ordinal",
        )
        .bind(conv_id.to_hex())
        .bind(ordinal + 1)
        .execute(&mut *tx)
        .await?;

        let outbox_id = opts.outbox_id.unwrap_or_else(OutboxId::generate);
        let mut record = OutboxRecord::new(conv_id.clone(), outbox_id, msg, ordinal as u64, Utc::now());
        record.set_client_prev(opts.client_prev);
        record.identify_behavior = opts.identify;
        record.prepare_opts = opts.prepare;
        record.send_opts = opts.send;
        record.preview = opts.preview;
        record.reply_to = opts.reply_to.map(Box::new);

        let record_enc = self.encrypt_record(&record).await?;
        sqlx::query(&format!(
            "INSERT INTO outbox ({OUTBOX_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(record.outbox_id.to_hex())
        .bind(conv_id.to_hex())
        .bind(ordinal)
        .bind(record.state.as_str())
        .bind(Option::<&str>::None)
        .bind(record.is_ephemeral())
        .bind(record.send_epoch as i64)
        .bind(record.ctime)
        .bind(record_enc)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(conv_id = %conv_id, outbox_id = %record.outbox_id, ordinal, "enqueued outbox record");
        Ok(record)
    }

    pub async fn get(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        self.load(outbox_id).await
    }

    /// Records ordered by conversation, then ordinal. `None` lists every
    /// conversation.
    pub async fn list(&self, conv_id: Option<&ConversationId>) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = match conv_id {
            Some(conv) => {
                sqlx::query_as::<_, OutboxRow>(&format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE conv_id = ? ORDER BY ordinal"
                ))
                .bind(conv.to_hex())
                .fetch_all(&self.store.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OutboxRow>(&format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY conv_id, ordinal"
                ))
                .fetch_all(&self.store.pool)
                .await?
            }
        };
        self.decode_all(rows).await
    }

    /// Records still waiting to be sent, in send order.
    pub async fn pending(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE state = 'sending' ORDER BY conv_id, ordinal"
        ))
        .fetch_all(&self.store.pool)
        .await?;
        self.decode_all(rows).await
    }

    /// Start a send attempt: `Sending{n}` → `Sending{n+1}` and a new epoch.
    pub async fn mark_sending(&self, outbox_id: &OutboxId) -> Result<OutboxRecord, StoreError> {
        let updated = self
            .update(outbox_id, |record| {
                let attempts = record.record_attempt()?;
                record.send_epoch += 1;
                Ok(attempts)
            })
            .await?;
        match updated {
            Some((record, attempts)) => {
                debug!(outbox_id = %outbox_id, attempts, epoch = record.send_epoch, "marked sending");
                Ok(record)
            }
            None => Err(StoreError::NotFound(format!("outbox record {outbox_id}"))),
        }
    }

    /// Fail a record. Returns `None` when the record no longer exists.
    pub async fn mark_error(
        &self,
        outbox_id: &OutboxId,
        kind: OutboxErrorKind,
        message: &str,
    ) -> Result<Option<OutboxRecord>, StoreError> {
        let updated = self
            .update(outbox_id, |record| {
                record.fail(kind, message);
                Ok(())
            })
            .await?;
        if updated.is_some() {
            info!(outbox_id = %outbox_id, kind = kind.as_str(), "outbox record failed: {message}");
        }
        Ok(updated.map(|(record, ())| record))
    }

    /// The send started at `epoch` failed. Only the attempt that is still
    /// current may move the record into the error state.
    pub async fn fail_attempt(
        &self,
        outbox_id: &OutboxId,
        epoch: u64,
        kind: OutboxErrorKind,
        message: &str,
    ) -> Result<AttemptFailure, StoreError> {
        let Some(row) = self.fetch_row(outbox_id).await? else {
            return Ok(AttemptFailure::Missing);
        };
        let conv_id = ConversationId::from_hex(&row.conv_id)?;
        let lock = self.conv_lock(&conv_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(outbox_id).await? else {
            return Ok(AttemptFailure::Missing);
        };
        if record.send_epoch != epoch {
            debug!(
                outbox_id = %outbox_id,
                epoch,
                current_epoch = record.send_epoch,
                "stale send failure dropped"
            );
            return Ok(AttemptFailure::Stale { current_epoch: record.send_epoch });
        }
        record.fail(kind, message);
        if !self.save(&record).await? {
            return Ok(AttemptFailure::Missing);
        }
        info!(outbox_id = %outbox_id, kind = kind.as_str(), "outbox send failed: {message}");
        Ok(AttemptFailure::Failed(record))
    }

    /// Fail every record of a conversation that is not already failed.
    pub async fn mark_conversation_error(
        &self,
        conv_id: &ConversationId,
        kind: OutboxErrorKind,
        message: &str,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let lock = self.conv_lock(conv_id);
        let _guard = lock.lock().await;

        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE conv_id = ? AND state = 'sending' ORDER BY ordinal"
        ))
        .bind(conv_id.to_hex())
        .fetch_all(&self.store.pool)
        .await?;
        let mut failed = Vec::with_capacity(rows.len());
        for mut record in self.decode_all(rows).await? {
            record.fail(kind, message);
            if self.save(&record).await? {
                failed.push(record);
            }
        }
        info!(conv_id = %conv_id, count = failed.len(), kind = kind.as_str(), "failed conversation outbox");
        Ok(failed)
    }

    /// Put a failed record back into `Sending{0}` with a fresh ctime.
    ///
    /// Terminal failures are rejected; identity failures need `identify`.
    /// Retrying a record that is already sending is a no-op.
    pub async fn retry(
        &self,
        outbox_id: &OutboxId,
        identify: Option<IdentifyBehavior>,
    ) -> Result<OutboxRecord, StoreError> {
        let updated = self
            .update(outbox_id, |record| Ok(record.reset_for_retry(Utc::now(), identify)?))
            .await?;
        match updated {
            Some((record, changed)) => {
                if changed {
                    info!(outbox_id = %outbox_id, epoch = record.send_epoch, "retrying outbox record");
                }
                Ok(record)
            }
            None => Err(StoreError::NotFound(format!("outbox record {outbox_id}"))),
        }
    }

    /// Delete a record. Safe while a send is in flight: the eventual response
    /// finds nothing to confirm.
    pub async fn remove(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        let Some(row) = self.fetch_row(outbox_id).await? else {
            return Ok(None);
        };
        let conv_id = ConversationId::from_hex(&row.conv_id)?;
        let lock = self.conv_lock(&conv_id);
        let _guard = lock.lock().await;

        let Some(record) = self.load(outbox_id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM outbox WHERE outbox_id = ?")
            .bind(outbox_id.to_hex())
            .execute(&self.store.pool)
            .await?;
        Ok(Some(record))
    }

    /// User-initiated removal.
    pub async fn cancel(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        let removed = self.remove(outbox_id).await?;
        if removed.is_some() {
            info!(outbox_id = %outbox_id, "cancelled outbox record");
        }
        Ok(removed)
    }

    /// The server accepted the send started at `epoch`.
    pub async fn confirm(&self, outbox_id: &OutboxId, epoch: u64) -> Result<ConfirmOutcome, StoreError> {
        let Some(row) = self.fetch_row(outbox_id).await? else {
            debug!(outbox_id = %outbox_id, "confirmation for missing outbox record dropped");
            return Ok(ConfirmOutcome::Missing);
        };
        let conv_id = ConversationId::from_hex(&row.conv_id)?;
        let lock = self.conv_lock(&conv_id);
        let _guard = lock.lock().await;

        let Some(record) = self.load(outbox_id).await? else {
            return Ok(ConfirmOutcome::Missing);
        };
        if record.send_epoch != epoch {
            debug!(
                outbox_id = %outbox_id,
                epoch,
                current_epoch = record.send_epoch,
                "stale confirmation dropped"
            );
            return Ok(ConfirmOutcome::Stale { current_epoch: record.send_epoch });
        }
        sqlx::query("DELETE FROM outbox WHERE outbox_id = ?")
            .bind(outbox_id.to_hex())
            .execute(&self.store.pool)
            .await?;
        Ok(ConfirmOutcome::Removed(record))
    }

    /// Drop failed records older than their cutoff (ephemeral records use the
    /// shorter one). Returns the purged ephemeral records.
    pub async fn purge(
        &self,
        now: DateTime<Utc>,
        error_cutoff: Duration,
        ephemeral_cutoff: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE state = 'error' ORDER BY conv_id, ordinal"
        ))
        .fetch_all(&self.store.pool)
        .await?;

        let mut purged = 0usize;
        let mut ephemeral = Vec::new();
        for row in rows {
            let cutoff = if row.ephemeral { ephemeral_cutoff } else { error_cutoff };
            if now - row.ctime <= cutoff {
                continue;
            }
            let conv_id = ConversationId::from_hex(&row.conv_id)?;
            let lock = self.conv_lock(&conv_id);
            let _guard = lock.lock().await;
            let record = self.decode(&row).await?;
            // A retry may have raced us back to `sending`.
            let deleted = sqlx::query("DELETE FROM outbox WHERE outbox_id = ? AND state = 'error'")
                .bind(&row.outbox_id)
                .execute(&self.store.pool)
                .await?;
            if deleted.rows_affected() == 1 {
                purged += 1;
                if row.ephemeral {
                    ephemeral.push(record);
                }
            }
        }
        if purged > 0 {
            info!(purged, ephemeral = ephemeral.len(), "purged failed outbox records");
        }
        Ok(ephemeral)
    }

    /// Merge this conversation's records on top of a freshly loaded thread.
    pub async fn append_to_thread(
        &self,
        conv_id: &ConversationId,
        thread: &mut ThreadView,
    ) -> Result<usize, StoreError> {
        let records = self.list(Some(conv_id)).await?;
        Ok(thread.merge_outbox(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_unlocked;
    use chat_proto::header::{ClientHeader, ConversationTriple, MessageType, TopicType};
    use chat_proto::ids::{DeviceId, TlfId, TopicId, UserId};
    use chat_proto::message::MessageBody;
    use chat_proto::outbox::OutboxState;
    use chat_proto::ProtoError;

    fn plaintext(tag: u8, text: &str) -> MessagePlaintext {
        MessagePlaintext {
            client_header: ClientHeader {
                conv: ConversationTriple {
                    tlf_id: TlfId::new(vec![tag]),
                    topic_id: TopicId::new(vec![tag]),
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
            },
            body: MessageBody::Text { body: text.into() },
            recipients: vec![],
        }
    }

    fn conv(tag: u8) -> ConversationId {
        plaintext(tag, "").client_header.conv.conversation_id()
    }

    async fn outbox(dir: &tempfile::TempDir) -> Outbox {
        Outbox::new(open_unlocked(dir).await)
    }

    #[tokio::test]
    async fn ordinals_increase_and_never_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let c = conv(1);
        let a = ob.enqueue(&c, plaintext(1, "a"), EnqueueOptions::default()).await.unwrap();
        let b = ob.enqueue(&c, plaintext(1, "b"), EnqueueOptions::default()).await.unwrap();
        let third = ob.enqueue(&c, plaintext(1, "c"), EnqueueOptions::default()).await.unwrap();
        assert_eq!((a.ordinal, b.ordinal, third.ordinal), (1, 2, 3));

        ob.cancel(&third.outbox_id).await.unwrap();
        let d = ob.enqueue(&c, plaintext(1, "d"), EnqueueOptions::default()).await.unwrap();
        assert_eq!(d.ordinal, 4);

        // Other conversations count independently.
        let other = ob.enqueue(&conv(2), plaintext(2, "x"), EnqueueOptions::default()).await.unwrap();
        assert_eq!(other.ordinal, 1);
    }

    #[tokio::test]
    async fn concurrent_enqueues_get_distinct_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let c = conv(3);
        let mut handles = Vec::new();
        for i in 0..16 {
            let ob = ob.clone();
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                ob.enqueue(&c, plaintext(3, &format!("m{i}")), EnqueueOptions::default())
                    .await
                    .unwrap()
                    .ordinal
            }));
        }
        let mut ordinals = Vec::new();
        for h in handles {
            ordinals.push(h.await.unwrap());
        }
        ordinals.sort_unstable();
        assert_eq!(ordinals, (1..=16).collect::<Vec<u64>>());

        let listed: Vec<u64> = ob.list(Some(&c)).await.unwrap().iter().map(|r| r.ordinal).collect();
        assert_eq!(listed, (1..=16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn records_survive_reopen_and_are_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let c = conv(4);
        let id = {
            let ob = outbox(&dir).await;
            ob.enqueue(&c, plaintext(4, "top secret draft"), EnqueueOptions::default())
                .await
                .unwrap()
                .outbox_id
        };
        let ob = outbox(&dir).await;
        let rec = ob.get(&id).await.unwrap().expect("record persisted");
        assert_eq!(rec.msg.body, MessageBody::Text { body: "top secret draft".into() });

        let raw: String = sqlx::query_scalar("SELECT record_enc FROM outbox")
            .fetch_one(&ob.store.pool)
            .await
            .unwrap();
        assert!(!raw.contains("secret"));
    }

    #[tokio::test]
    async fn retry_follows_error_taxonomy() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let c = conv(5);
        let rec = ob.enqueue(&c, plaintext(5, "a"), EnqueueOptions::default()).await.unwrap();

        ob.mark_sending(&rec.outbox_id).await.unwrap();
        ob.mark_error(&rec.outbox_id, OutboxErrorKind::Offline, "offline").await.unwrap();
        let retried = ob.retry(&rec.outbox_id, None).await.unwrap();
        assert_eq!(retried.state, OutboxState::Sending { attempts: 0 });

        ob.mark_error(&rec.outbox_id, OutboxErrorKind::Duplicate, "dup").await.unwrap();
        let err = ob.retry(&rec.outbox_id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Proto(ProtoError::RetryRejected { .. })));
        assert!(ob.get(&rec.outbox_id).await.unwrap().unwrap().is_error());
    }

    #[tokio::test]
    async fn late_responses_never_resurrect_records() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let c = conv(6);

        // Cancelled mid-flight.
        let rec = ob.enqueue(&c, plaintext(6, "a"), EnqueueOptions::default()).await.unwrap();
        let sending = ob.mark_sending(&rec.outbox_id).await.unwrap();
        ob.cancel(&rec.outbox_id).await.unwrap();
        assert_eq!(
            ob.confirm(&rec.outbox_id, sending.send_epoch).await.unwrap(),
            ConfirmOutcome::Missing
        );
        assert!(ob.mark_error(&rec.outbox_id, OutboxErrorKind::Misc, "late").await.unwrap().is_none());
        assert!(ob.list(Some(&c)).await.unwrap().is_empty());

        // Retried mid-flight: the first attempt's response is stale.
        let rec = ob.enqueue(&c, plaintext(6, "b"), EnqueueOptions::default()).await.unwrap();
        let first = ob.mark_sending(&rec.outbox_id).await.unwrap();
        ob.mark_error(&rec.outbox_id, OutboxErrorKind::Offline, "offline").await.unwrap();
        ob.retry(&rec.outbox_id, None).await.unwrap();
        assert!(matches!(
            ob.confirm(&rec.outbox_id, first.send_epoch).await.unwrap(),
            ConfirmOutcome::Stale { .. }
        ));
        let second = ob.mark_sending(&rec.outbox_id).await.unwrap();
        assert!(matches!(
            ob.confirm(&rec.outbox_id, second.send_epoch).await.unwrap(),
            ConfirmOutcome::Removed(_)
        ));
    }

    #[tokio::test]
    async fn late_failure_leaves_retried_attempt_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let c = conv(6);
        let rec = ob.enqueue(&c, plaintext(6, "a"), EnqueueOptions::default()).await.unwrap();

        let first = ob.mark_sending(&rec.outbox_id).await.unwrap();
        ob.mark_error(&rec.outbox_id, OutboxErrorKind::Offline, "offline").await.unwrap();
        ob.retry(&rec.outbox_id, None).await.unwrap();
        assert!(matches!(
            ob.fail_attempt(&rec.outbox_id, first.send_epoch, OutboxErrorKind::Duplicate, "late")
                .await
                .unwrap(),
            AttemptFailure::Stale { .. }
        ));
        let current = ob.get(&rec.outbox_id).await.unwrap().unwrap();
        assert_eq!(current.state, OutboxState::Sending { attempts: 0 });

        let second = ob.mark_sending(&rec.outbox_id).await.unwrap();
        let AttemptFailure::Failed(failed) = ob
            .fail_attempt(&rec.outbox_id, second.send_epoch, OutboxErrorKind::Duplicate, "dup")
            .await
            .unwrap()
        else {
            panic!("current attempt should fail the record");
        };
        assert_eq!(failed.error_kind(), Some(OutboxErrorKind::Duplicate));

        ob.cancel(&rec.outbox_id).await.unwrap();
        assert_eq!(
            ob.fail_attempt(&rec.outbox_id, second.send_epoch, OutboxErrorKind::Misc, "gone")
                .await
                .unwrap(),
            AttemptFailure::Missing
        );
    }

    #[tokio::test]
    async fn conversation_error_spares_other_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let (c1, c2) = (conv(7), conv(8));
        ob.enqueue(&c1, plaintext(7, "a"), EnqueueOptions::default()).await.unwrap();
        ob.enqueue(&c1, plaintext(7, "b"), EnqueueOptions::default()).await.unwrap();
        ob.enqueue(&c2, plaintext(8, "c"), EnqueueOptions::default()).await.unwrap();

        let failed = ob
            .mark_conversation_error(&c1, OutboxErrorKind::TooManyAttempts, "too many")
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
        assert!(ob.list(Some(&c2)).await.unwrap()[0].is_sending());
        assert_eq!(ob.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_drops_only_old_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ob = outbox(&dir).await;
        let c = conv(9);
        let old = ob.enqueue(&c, plaintext(9, "old"), EnqueueOptions::default()).await.unwrap();
        let eph_opts = EnqueueOptions {
            send: Some(SendOptions { ephemeral_lifetime_secs: Some(60), join_mentions: false }),
            ..EnqueueOptions::default()
        };
        let eph = ob.enqueue(&c, plaintext(9, "boom"), eph_opts).await.unwrap();
        let fresh = ob.enqueue(&c, plaintext(9, "sending"), EnqueueOptions::default()).await.unwrap();
        ob.mark_error(&old.outbox_id, OutboxErrorKind::Misc, "x").await.unwrap();
        ob.mark_error(&eph.outbox_id, OutboxErrorKind::Misc, "x").await.unwrap();

        // Two days on: past the ephemeral cutoff, inside the error cutoff.
        let now = Utc::now() + Duration::days(2);
        let purged = ob.purge(now, Duration::days(7), Duration::hours(24)).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].outbox_id, eph.outbox_id);

        let later = Utc::now() + Duration::days(8);
        assert!(ob.purge(later, Duration::days(7), Duration::hours(24)).await.unwrap().is_empty());
        let left: Vec<_> = ob.list(Some(&c)).await.unwrap().into_iter().map(|r| r.outbox_id).collect();
        assert_eq!(left, vec![fresh.outbox_id]);
    }
}
