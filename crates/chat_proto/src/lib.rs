//! chat_proto — wire types, envelope codec and client state machines
//!
//! # Modules
//! - `ids`      — byte-string identifiers (hex on the wire) and message ids
//! - `version`  — forward-compatible version gating (`MetaInfo`)
//! - `header`   — client header and the versioned sealed-header container
//! - `message`  — message bodies and the versioned body container
//! - `boxed`    — boxed messages as the server stores them
//! - `codec`    — body padding
//! - `keys`     — key collaborator traits
//! - `boxer`    — seal / unbox
//! - `unboxed`  — the five client-visible message states
//! - `outbox`   — outbox records and the retry taxonomy
//! - `sync`     — inbox versions, sync results and reconciliation
//! - `thread`   — thread views, pagination, prev-pointer checks

pub mod boxed;
pub mod boxer;
pub mod codec;
pub mod error;
pub mod header;
pub mod ids;
pub mod keys;
pub mod message;
pub mod outbox;
pub mod sync;
pub mod thread;
pub mod unboxed;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use boxed::{BoxedMessage, ServerHeader};
pub use boxer::{Boxer, SenderKeys};
pub use codec::PaddingMode;
pub use error::ProtoError;
pub use ids::{ConversationId, DeviceId, MessageId, OutboxId, UserId};
pub use outbox::{OutboxErrorKind, OutboxRecord, OutboxState};
pub use sync::{InboxVersion, SyncResult};
pub use unboxed::{UnboxErrorKind, UnboxedMessage};
