//! Thread views, pagination cursors and history consistency checks.
//!
//! Threads are ordered newest first. Pending outbox records sit on top of the
//! server messages and point at the newest server message via `client_prev`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::boxed::BoxedMessage;
use crate::error::ProtoError;
use crate::ids::{MessageId, OutboxId};
use crate::outbox::{OutboxErrorKind, OutboxRecord};
use crate::unboxed::UnboxedMessage;

/// Opaque paging position handed out by the server. Callers pass it back
/// unchanged and never look inside.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Vec<u8>);

impl Cursor {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        hex::decode(s).map(Self).map_err(|_| ProtoError::InvalidCursor)
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cursor({} bytes)", self.0.len())
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Cursor::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pagination {
    /// Cursor for older messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Cursor>,
    /// Cursor for newer messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Cursor>,
    pub num: u32,
    /// No older messages remain.
    #[serde(default)]
    pub last: bool,
}

impl Pagination {
    pub fn first_page(num: u32) -> Self {
        Self { num, ..Self::default() }
    }

    /// Requests without a `previous` cursor ask for the newest page.
    pub fn is_first_page(&self) -> bool {
        self.previous.is_none() && self.next.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ThreadViewBoxed {
    pub messages: Vec<BoxedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ThreadView {
    pub messages: Vec<UnboxedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl ThreadView {
    /// Newest server-backed message id in the view.
    pub fn newest_server_id(&self) -> MessageId {
        self.messages
            .iter()
            .map(UnboxedMessage::message_id)
            .find(|id| !id.is_none())
            .unwrap_or(MessageId::NONE)
    }

    /// Put pending outbox records on top of the thread, newest first.
    ///
    /// Records whose outbox id already appears in the thread (the server
    /// confirmed them) and records that failed as duplicates are skipped.
    /// Each merged record's `client_prev` is re-pointed at the newest server
    /// message. Returns the number of records merged.
    pub fn merge_outbox(&mut self, mut records: Vec<OutboxRecord>) -> usize {
        let confirmed: HashSet<OutboxId> = self
            .messages
            .iter()
            .filter(|m| !matches!(m, UnboxedMessage::Outbox(_)))
            .filter_map(|m| m.outbox_id().cloned())
            .collect();
        let prev = self.newest_server_id();

        records.retain(|r| {
            !confirmed.contains(&r.outbox_id) && r.error_kind() != Some(OutboxErrorKind::Duplicate)
        });
        records.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        let merged = records.len();

        let mut out = Vec::with_capacity(merged + self.messages.len());
        for mut record in records {
            record.set_client_prev(prev);
            out.push(UnboxedMessage::Outbox(Box::new(record)));
        }
        out.append(&mut self.messages);
        self.messages = out;
        merged
    }
}

/// A message claims a predecessor whose sealed header hash differs from the
/// one we hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevPointerMismatch {
    pub message_id: MessageId,
    pub prev_id: MessageId,
    pub expected: Vec<u8>,
    pub actual: Vec<u8>,
}

/// Check every valid message's prev pointers against the header hashes of
/// messages we hold: the ones in `messages` plus `known` from earlier pages.
/// Pointers to messages we do not hold are not checked.
pub fn check_prev_pointers(
    messages: &[UnboxedMessage],
    known: &HashMap<MessageId, Vec<u8>>,
) -> Vec<PrevPointerMismatch> {
    let mut hashes: HashMap<MessageId, &[u8]> =
        known.iter().map(|(id, h)| (*id, h.as_slice())).collect();
    for m in messages {
        if let Some(v) = m.as_valid() {
            if !v.message_id().is_none() {
                hashes.insert(v.message_id(), &v.header_hash);
            }
        }
    }

    let mut mismatches = Vec::new();
    for m in messages {
        let Some(v) = m.as_valid() else { continue };
        for p in &v.client_header.prev {
            if let Some(actual) = hashes.get(&p.id) {
                if *actual != p.hash.as_slice() {
                    mismatches.push(PrevPointerMismatch {
                        message_id: v.message_id(),
                        prev_id: p.id,
                        expected: p.hash.clone(),
                        actual: actual.to_vec(),
                    });
                }
            }
        }
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::boxed::ServerHeader;
    use crate::header::MessagePreviousPointer;
    use crate::testutil::plaintext;
    use crate::unboxed::MessageUnboxedValid;

    fn valid(id: u64, header_hash: u8, prev: Vec<MessagePreviousPointer>, outbox_id: Option<OutboxId>) -> UnboxedMessage {
        let mut msg = plaintext("m");
        msg.client_header.prev = prev;
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
            header_hash: vec![header_hash; 32],
            body_hash: vec![0; 32],
            verify_key: vec![0; 32],
            key_generation: 1,
            at_mentions: vec![],
            sender_device_revoked_at: None,
        }))
    }

    fn record(ordinal: u64) -> OutboxRecord {
        let msg = plaintext("pending");
        let conv = msg.client_header.conv.conversation_id();
        OutboxRecord::new(conv, OutboxId::generate(), msg, ordinal, Utc::now())
    }

    #[test]
    fn outbox_sits_on_top_newest_first() {
        let mut view = ThreadView { messages: vec![valid(7, 1, vec![], None), valid(6, 2, vec![], None)], pagination: None };
        let merged = view.merge_outbox(vec![record(1), record(2)]);
        assert_eq!(merged, 2);
        let ordinals: Vec<_> = view.messages.iter().map(|m| m.ordinal()).collect();
        assert_eq!(ordinals, vec![Some(2), Some(1), None, None]);
        for m in &view.messages[..2] {
            assert_eq!(m.as_outbox().unwrap().client_prev(), MessageId(7));
        }
    }

    #[test]
    fn confirmed_and_duplicate_records_are_skipped() {
        let confirmed = record(1);
        let mut dup = record(2);
        dup.fail(OutboxErrorKind::Duplicate, "dup");
        let pending = record(3);
        let mut view = ThreadView {
            messages: vec![valid(9, 1, vec![], Some(confirmed.outbox_id.clone()))],
            pagination: None,
        };
        assert_eq!(view.merge_outbox(vec![confirmed, dup, pending.clone()]), 1);
        assert_eq!(view.messages[0].outbox_id(), Some(&pending.outbox_id));
    }

    #[test]
    fn prev_pointer_hash_mismatch_is_reported() {
        let good = MessagePreviousPointer { id: MessageId(1), hash: vec![1; 32] };
        let bad = MessagePreviousPointer { id: MessageId(2), hash: vec![9; 32] };
        let unknown = MessagePreviousPointer { id: MessageId(100), hash: vec![3; 32] };
        let messages = vec![
            valid(3, 3, vec![good, bad, unknown], None),
            valid(2, 2, vec![], None),
        ];
        let known = HashMap::from([(MessageId(1), vec![1; 32])]);
        let mismatches = check_prev_pointers(&messages, &known);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].prev_id, MessageId(2));
        assert_eq!(mismatches[0].actual, vec![2; 32]);
    }

    #[test]
    fn cursor_is_opaque_hex_on_the_wire() {
        let c = Cursor::new(vec![0xde, 0xad]);
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"dead\"");
        assert!(Cursor::parse("zz").is_err());
    }
}
