//! Background delivery of queued outbox records.
//!
//! Each pass walks the pending records conversation by conversation in
//! ordinal order. The first record in a conversation that cannot be sent
//! stops that conversation for the pass so later messages never overtake it;
//! other conversations carry on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use chat_crypto::hash;
use chat_proto::header::EphemeralMetadata;
use chat_proto::ids::{ConversationId, OutboxId};
use chat_proto::message::MessagePlaintext;
use chat_proto::unboxed::MessageUnboxedValid;
use chat_proto::{
    Boxer, BoxedMessage, OutboxErrorKind, OutboxRecord, ProtoError, SenderKeys, ServerHeader,
    UnboxedMessage,
};
use chat_store::outbox::{AttemptFailure, ConfirmOutcome, EnqueueOptions};
use chat_store::{Outbox, StoreError};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::keys::SealingKeys;
use crate::transport::{ChatTransport, TransportError};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub send_timeout: Duration,
    pub max_attempts: u32,
    pub expiry: chrono::Duration,
    pub error_purge_cutoff: chrono::Duration,
    pub ephemeral_purge_cutoff: chrono::Duration,
    pub interval: Duration,
}

impl From<&ClientConfig> for DeliveryConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            max_attempts: config.max_send_attempts,
            expiry: config.message_expiry(),
            error_purge_cutoff: config.error_purge_cutoff(),
            ephemeral_purge_cutoff: config.ephemeral_purge_cutoff(),
            interval: config.deliver_interval(),
        }
    }
}

/// What happened to one record during a delivery pass.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Confirmed by the server and removed from the outbox.
    Sent { outbox_id: OutboxId, message: Box<UnboxedMessage> },
    /// The record was cancelled or retried while its send was in flight; the
    /// server response was discarded.
    Dropped { outbox_id: OutboxId },
    /// The record is now in the error state.
    Failed { outbox_id: OutboxId, kind: OutboxErrorKind },
    /// Transient failure; the record stays `Sending` and is tried again on a
    /// later pass.
    Deferred { outbox_id: OutboxId, reason: String },
}

impl DeliveryOutcome {
    pub fn outbox_id(&self) -> &OutboxId {
        match self {
            DeliveryOutcome::Sent { outbox_id, .. }
            | DeliveryOutcome::Dropped { outbox_id }
            | DeliveryOutcome::Failed { outbox_id, .. }
            | DeliveryOutcome::Deferred { outbox_id, .. } => outbox_id,
        }
    }

    /// Later records in the same conversation must wait.
    fn blocks_conversation(&self) -> bool {
        matches!(self, DeliveryOutcome::Failed { .. } | DeliveryOutcome::Deferred { .. })
    }
}

pub struct Deliverer {
    outbox: Outbox,
    transport: Arc<dyn ChatTransport>,
    keys: Arc<dyn SealingKeys>,
    boxer: Boxer,
    config: DeliveryConfig,
    wake: Notify,
    /// One pass at a time, so no record is sealed or posted twice.
    pass: Mutex<()>,
}

impl Deliverer {
    pub fn new(
        outbox: Outbox,
        transport: Arc<dyn ChatTransport>,
        keys: Arc<dyn SealingKeys>,
        boxer: Boxer,
        config: DeliveryConfig,
    ) -> Self {
        Self { outbox, transport, keys, boxer, config, wake: Notify::new(), pass: Mutex::new(()) }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Queue a message and wake the delivery loop.
    pub async fn queue(
        &self,
        conv_id: &ConversationId,
        msg: MessagePlaintext,
        opts: EnqueueOptions,
    ) -> Result<OutboxRecord, ClientError> {
        let record = self.outbox.enqueue(conv_id, msg, opts).await?;
        self.wake.notify_one();
        Ok(record)
    }

    /// Wake the delivery loop, e.g. after connectivity returns.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Put every record that failed with `Offline` back into the queue.
    pub async fn retry_offline(&self) -> Result<usize, ClientError> {
        let mut retried = 0;
        for record in self.outbox.list(None).await? {
            if record.error_kind() != Some(OutboxErrorKind::Offline) {
                continue;
            }
            match self.outbox.retry(&record.outbox_id, None).await {
                Ok(_) => retried += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if retried > 0 {
            info!(retried, "requeued offline outbox records");
            self.nudge();
        }
        Ok(retried)
    }

    pub async fn purge(&self) -> Result<Vec<OutboxRecord>, ClientError> {
        Ok(self
            .outbox
            .purge(Utc::now(), self.config.error_purge_cutoff, self.config.ephemeral_purge_cutoff)
            .await?)
    }

    /// One delivery pass over everything pending. A call made while another
    /// pass runs waits for it and then sees only what is still pending.
    pub async fn deliver_pending(&self) -> Result<Vec<DeliveryOutcome>, ClientError> {
        let _pass = self.pass.lock().await;
        let mut by_conv: BTreeMap<ConversationId, Vec<OutboxRecord>> = BTreeMap::new();
        for record in self.outbox.pending().await? {
            by_conv.entry(record.conv_id.clone()).or_default().push(record);
        }

        let mut outcomes = Vec::new();
        for (conv_id, mut records) in by_conv {
            records.sort_by_key(|r| r.ordinal);
            for record in records {
                let outcome = self.deliver(record).await?;
                let blocked = outcome.blocks_conversation();
                outcomes.push(outcome);
                if blocked {
                    debug!(conv_id = %conv_id, "conversation blocked for this pass");
                    break;
                }
            }
        }
        Ok(outcomes)
    }

    async fn deliver(&self, record: OutboxRecord) -> Result<DeliveryOutcome, ClientError> {
        let outbox_id = record.outbox_id.clone();

        if Utc::now() - record.ctime > self.config.expiry {
            let reason = "message expired before it could be sent";
            return self.fail(&outbox_id, record.send_epoch, OutboxErrorKind::Expired, reason).await;
        }
        if record.attempts() >= self.config.max_attempts {
            let failed = self
                .outbox
                .mark_conversation_error(
                    &record.conv_id,
                    OutboxErrorKind::TooManyAttempts,
                    &format!("gave up after {} attempts", record.attempts()),
                )
                .await?;
            warn!(conv_id = %record.conv_id, failed = failed.len(), "send attempts exhausted");
            return Ok(DeliveryOutcome::Failed { outbox_id, kind: OutboxErrorKind::TooManyAttempts });
        }

        let sending = match self.outbox.mark_sending(&outbox_id).await {
            Ok(record) => record,
            // Cancelled or failed since `pending()` was read.
            Err(StoreError::NotFound(_)) | Err(StoreError::Proto(ProtoError::InvalidTransition(_))) => {
                return Ok(DeliveryOutcome::Dropped { outbox_id });
            }
            Err(e) => return Err(e.into()),
        };
        let epoch = sending.send_epoch;

        let boxed = match self.seal(&sending) {
            Ok(boxed) => boxed,
            Err(e) => return self.fail(&outbox_id, epoch, OutboxErrorKind::Misc, &e.to_string()).await,
        };

        let posted = tokio::time::timeout(
            self.config.send_timeout,
            self.transport.post(&sending.conv_id, &boxed),
        )
        .await;
        match posted {
            Err(_) => Ok(DeliveryOutcome::Deferred {
                outbox_id,
                reason: format!("post timed out after {:?}", self.config.send_timeout),
            }),
            Ok(Err(TransportError::Offline(msg))) => {
                self.fail(&outbox_id, epoch, OutboxErrorKind::Offline, &msg).await
            }
            Ok(Err(TransportError::Rejected { reason, message })) => {
                self.fail(&outbox_id, epoch, reason.error_kind(), &message).await
            }
            Ok(Err(TransportError::Server(msg))) => {
                debug!(outbox_id = %outbox_id, "transient post failure: {msg}");
                Ok(DeliveryOutcome::Deferred { outbox_id, reason: msg })
            }
            Ok(Ok(server_header)) => match self.outbox.confirm(&outbox_id, epoch).await? {
                ConfirmOutcome::Removed(record) => {
                    let message = confirmed_message(record, &sending, boxed, server_header)?;
                    info!(
                        conv_id = %sending.conv_id,
                        outbox_id = %outbox_id,
                        message_id = %message.message_id(),
                        "message delivered"
                    );
                    Ok(DeliveryOutcome::Sent { outbox_id, message: Box::new(message) })
                }
                ConfirmOutcome::Stale { current_epoch } => {
                    debug!(outbox_id = %outbox_id, epoch, current_epoch, "late send response dropped");
                    Ok(DeliveryOutcome::Dropped { outbox_id })
                }
                ConfirmOutcome::Missing => Ok(DeliveryOutcome::Dropped { outbox_id }),
            },
        }
    }

    /// Fail the attempt started at `epoch`. A record retried or cancelled in
    /// the meantime is left as it is.
    async fn fail(
        &self,
        outbox_id: &OutboxId,
        epoch: u64,
        kind: OutboxErrorKind,
        message: &str,
    ) -> Result<DeliveryOutcome, ClientError> {
        match self.outbox.fail_attempt(outbox_id, epoch, kind, message).await? {
            AttemptFailure::Failed(_) => Ok(DeliveryOutcome::Failed { outbox_id: outbox_id.clone(), kind }),
            AttemptFailure::Stale { current_epoch } => {
                debug!(outbox_id = %outbox_id, epoch, current_epoch, "late send failure dropped");
                Ok(DeliveryOutcome::Dropped { outbox_id: outbox_id.clone() })
            }
            AttemptFailure::Missing => Ok(DeliveryOutcome::Dropped { outbox_id: outbox_id.clone() }),
        }
    }

    fn seal(&self, record: &OutboxRecord) -> Result<BoxedMessage, ClientError> {
        let conv_id = &record.conv_id;
        let generation = self
            .keys
            .current_generation(conv_id)
            .ok_or_else(|| ClientError::MissingKeys(conv_id.to_hex()))?;
        let conv_key = self
            .keys
            .conversation_key(conv_id, generation)
            .ok_or_else(|| ClientError::MissingKeys(conv_id.to_hex()))?;

        let mut header = record.msg.client_header.clone();
        let lifetime = record.send_opts.as_ref().and_then(|o| o.ephemeral_lifetime_secs);
        if let (Some(lifetime_secs), None) = (lifetime, &header.ephemeral_metadata) {
            header.ephemeral_metadata =
                Some(EphemeralMetadata { lifetime_secs, generation, exploded_by: None });
        }
        let seed = match &header.ephemeral_metadata {
            Some(meta) => Some(
                self.keys
                    .ephemeral_seed(conv_id, meta.generation)
                    .ok_or_else(|| ClientError::MissingKeys(conv_id.to_hex()))?,
            ),
            None => None,
        };
        let pairwise = self.keys.pairwise_recipients(conv_id);

        let keys = SenderKeys {
            device_key: self.keys.device_key(),
            generation,
            conv_key: &*conv_key,
            ephemeral_seed: seed.as_deref(),
            pairwise: pairwise.iter().map(|(device, key)| (device.clone(), **key)).collect(),
        };
        Ok(self.boxer.seal(&header, &record.msg.body, &keys)?)
    }

    /// Spawn the delivery loop. It wakes on the interval, on `queue` and on
    /// `nudge`, and purges old error records about once an hour.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, DeliveryLoopHandle) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(interval_secs = self.config.interval.as_secs(), "delivery loop started");
            let mut last_purge: Option<Instant> = None;
            loop {
                if last_purge.map_or(true, |at| at.elapsed() >= PURGE_INTERVAL) {
                    match self.purge().await {
                        Ok(purged) if !purged.is_empty() => {
                            debug!(ephemeral = purged.len(), "purged old outbox records")
                        }
                        Ok(_) => {}
                        Err(e) => warn!("outbox purge failed: {e}"),
                    }
                    last_purge = Some(Instant::now());
                }

                if let Err(e) = self.deliver_pending().await {
                    warn!("delivery pass failed: {e}");
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => {}
                    _ = self.wake.notified() => {
                        debug!("delivery loop woken early");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("delivery loop shutting down");
                            return;
                        }
                    }
                }
            }
        });
        (handle, DeliveryLoopHandle { shutdown_tx })
    }
}

/// Control for a spawned delivery loop.
pub struct DeliveryLoopHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl DeliveryLoopHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The `Valid` message a confirmed record turns into.
fn confirmed_message(
    record: OutboxRecord,
    sent: &OutboxRecord,
    boxed: BoxedMessage,
    server_header: ServerHeader,
) -> Result<UnboxedMessage, ClientError> {
    let valid = MessageUnboxedValid {
        server_header: Some(server_header),
        client_header: boxed.client_header,
        at_mentions: sent.msg.body.at_mentions(),
        body: sent.msg.body.clone(),
        header_hash: hash::header_hash(&boxed.header_ciphertext).to_vec(),
        body_hash: hash::body_hash(&boxed.body_ciphertext).to_vec(),
        verify_key: boxed.verify_key,
        key_generation: boxed.key_generation,
        sender_device_revoked_at: None,
    };
    Ok(UnboxedMessage::Outbox(Box::new(record)).confirm_outbox(UnboxedMessage::Valid(Box::new(valid)))?)
}
