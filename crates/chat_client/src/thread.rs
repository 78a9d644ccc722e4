//! Thread loading: fetch, unbox, check, merge the outbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use chat_proto::ids::{ConversationId, MessageId};
use chat_proto::keys::{DecryptionKeys, KeyDirectory};
use chat_proto::thread::{check_prev_pointers, Pagination, PrevPointerMismatch, ThreadView};
use chat_proto::Boxer;
use chat_store::Outbox;

use crate::error::ClientError;
use crate::transport::{ChatTransport, TransportError};

/// Header hashes kept per conversation for checking prev pointers of
/// messages loaded later.
const KNOWN_HASHES_PER_CONV: usize = 1024;

#[derive(Debug, Clone)]
pub struct ThreadLoad {
    pub view: ThreadView,
    /// Prev pointers whose hash disagrees with the message we hold.
    pub prev_mismatches: Vec<PrevPointerMismatch>,
    /// Outbox records placed on top of the page.
    pub outbox_merged: usize,
}

pub struct ThreadLoader {
    transport: Arc<dyn ChatTransport>,
    outbox: Outbox,
    boxer: Boxer,
    directory: Arc<dyn KeyDirectory>,
    keys: Arc<dyn DecryptionKeys>,
    timeout: Duration,
    /// Header hashes of valid messages seen on earlier pages, per conversation.
    known_hashes: Mutex<HashMap<ConversationId, HashMap<MessageId, Vec<u8>>>>,
}

impl ThreadLoader {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        outbox: Outbox,
        boxer: Boxer,
        directory: Arc<dyn KeyDirectory>,
        keys: Arc<dyn DecryptionKeys>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            outbox,
            boxer,
            directory,
            keys,
            timeout,
            known_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Load one page, newest first. Every boxed message comes back as some
    /// `UnboxedMessage`; only transport and store failures are errors.
    pub async fn load(&self, conv_id: &ConversationId, pagination: &Pagination) -> Result<ThreadLoad, ClientError> {
        let boxed = match tokio::time::timeout(self.timeout, self.transport.get_thread(conv_id, pagination)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Server(format!(
                    "get_thread timed out after {:?}",
                    self.timeout
                ))
                .into())
            }
        };

        let mut messages: Vec<_> = boxed
            .messages
            .iter()
            .map(|m| self.boxer.unbox(m, self.directory.as_ref(), self.keys.as_ref()))
            .collect();
        messages.sort_by(|a, b| b.message_id().cmp(&a.message_id()));

        let prev_mismatches = {
            let mut known = self.known_hashes.lock();
            let known = known.entry(conv_id.clone()).or_default();
            let mismatches = check_prev_pointers(&messages, known);
            let seen = messages
                .iter()
                .filter_map(|m| m.as_valid())
                .map(|v| (v.message_id(), v.header_hash.clone()));
            remember(known, seen, KNOWN_HASHES_PER_CONV);
            mismatches
        };
        for mismatch in &prev_mismatches {
            warn!(
                conv_id = %conv_id,
                message_id = %mismatch.message_id,
                prev_id = %mismatch.prev_id,
                "prev pointer hash mismatch"
            );
        }

        let mut view = ThreadView { messages, pagination: boxed.pagination };
        let outbox_merged = if pagination.is_first_page() {
            self.outbox.append_to_thread(conv_id, &mut view).await?
        } else {
            0
        };
        debug!(
            conv_id = %conv_id,
            messages = view.messages.len(),
            outbox_merged,
            "thread page loaded"
        );
        Ok(ThreadLoad { view, prev_mismatches, outbox_merged })
    }
}

/// Record header hashes, keeping only the newest `limit` ids. New messages
/// point back at recent ones, so the oldest are the first to go.
fn remember(
    known: &mut HashMap<MessageId, Vec<u8>>,
    seen: impl IntoIterator<Item = (MessageId, Vec<u8>)>,
    limit: usize,
) {
    for (id, hash) in seen {
        if !id.is_none() {
            known.insert(id, hash);
        }
    }
    if known.len() > limit {
        let mut ids: Vec<MessageId> = known.keys().copied().collect();
        ids.sort_unstable();
        let cutoff = ids[ids.len() - limit];
        known.retain(|id, _| *id >= cutoff);
    }
}
