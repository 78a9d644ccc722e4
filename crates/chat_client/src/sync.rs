//! Inbox synchronisation.
//!
//! [`InboxSyncer`] is the only writer that talks to the server about the
//! inbox. Syncs run one at a time; a caller that arrives while a sync is in
//! flight waits for it and takes its result instead of starting another.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use chat_proto::sync::{Conversation, InboxVersion, PushDisposition};
use chat_proto::ProtoError;
use chat_store::inbox::ApplyOutcome;
use chat_store::{Inbox, StoreError};

use crate::error::SyncError;
use crate::transport::{ChatTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Current,
    Incremental { conversations: usize },
    /// The server cleared the inbox and the full listing was refetched.
    Refetched { conversations: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub version: InboxVersion,
    /// This caller shared a sync started by someone else.
    pub coalesced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Applied(PushDisposition),
    /// The push skipped versions; a full sync ran instead.
    Resynced(SyncReport),
}

pub struct InboxSyncer {
    inbox: Inbox,
    transport: Arc<dyn ChatTransport>,
    timeout: Duration,
    gate: tokio::sync::Mutex<()>,
    completed: AtomicU64,
    last: Mutex<Option<SyncReport>>,
}

impl InboxSyncer {
    pub fn new(inbox: Inbox, transport: Arc<dyn ChatTransport>, timeout: Duration) -> Self {
        Self {
            inbox,
            transport,
            timeout,
            gate: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Bring the local inbox up to date. On error the local inbox is left at
    /// its last applied version and the caller may simply try again.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let seen = self.completed.load(Ordering::Acquire);
        let _guard = self.gate.lock().await;
        if self.completed.load(Ordering::Acquire) != seen {
            if let Some(report) = *self.last.lock() {
                debug!(version = %report.version, "inbox sync coalesced");
                return Ok(SyncReport { coalesced: true, ..report });
            }
        }

        let report = self.run().await?;
        *self.last.lock() = Some(report);
        self.completed.fetch_add(1, Ordering::AcqRel);
        Ok(report)
    }

    async fn run(&self) -> Result<SyncReport, SyncError> {
        let status = self.inbox.status().await?;
        if status.needs_refetch {
            info!("resuming interrupted inbox refetch");
            return self.refetch().await;
        }

        let local = status.version;
        let result = self.bounded(self.transport.sync_inbox(local)).await?;
        debug!(%local, result = result.as_str(), "inbox sync result");
        match self.inbox.apply_sync(result).await? {
            ApplyOutcome::Unchanged => Ok(SyncReport {
                outcome: SyncOutcome::Current,
                version: local,
                coalesced: false,
            }),
            ApplyOutcome::Upserted { version, conversations } => Ok(SyncReport {
                outcome: SyncOutcome::Incremental { conversations },
                version,
                coalesced: false,
            }),
            ApplyOutcome::Cleared => self.refetch().await,
        }
    }

    async fn refetch(&self) -> Result<SyncReport, SyncError> {
        let full = self.bounded(self.transport.sync_all()).await?;
        self.inbox.complete_refetch(full.version, &full.conversations).await?;
        Ok(SyncReport {
            outcome: SyncOutcome::Refetched { conversations: full.conversations.len() },
            version: full.version,
            coalesced: false,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }

    /// Apply a pushed inbox change, falling back to a full sync when the
    /// push does not follow on from the local version.
    pub async fn handle_push(
        &self,
        version: InboxVersion,
        conversations: &[Conversation],
    ) -> Result<PushOutcome, SyncError> {
        match self.inbox.apply_push(version, conversations).await {
            Ok(disposition) => Ok(PushOutcome::Applied(disposition)),
            Err(StoreError::Proto(ProtoError::VersionMismatch { local, remote })) => {
                info!(local, remote, "inbox push out of sequence, resyncing");
                Ok(PushOutcome::Resynced(self.sync().await?))
            }
            Err(e) => Err(e.into()),
        }
    }
}
