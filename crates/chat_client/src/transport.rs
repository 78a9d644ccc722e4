//! Transport collaborator.
//!
//! The client only depends on the shapes exchanged with the server; the RPC
//! mechanism behind [`ChatTransport`] is up to the embedder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use chat_proto::ids::ConversationId;
use chat_proto::sync::{Conversation, InboxVersion, SyncResult};
use chat_proto::thread::{Pagination, ThreadViewBoxed};
use chat_proto::{BoxedMessage, OutboxErrorKind, ServerHeader};

/// Why the server refused a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostRejection {
    Duplicate,
    AlreadyDeleted,
    TooLong,
    RestrictedBot,
    MinWriter,
    Identify,
    UploadFailed,
}

impl PostRejection {
    pub fn error_kind(self) -> OutboxErrorKind {
        match self {
            PostRejection::Duplicate => OutboxErrorKind::Duplicate,
            PostRejection::AlreadyDeleted => OutboxErrorKind::AlreadyDeleted,
            PostRejection::TooLong => OutboxErrorKind::TooLong,
            PostRejection::RestrictedBot => OutboxErrorKind::RestrictedBot,
            PostRejection::MinWriter => OutboxErrorKind::MinWriter,
            PostRejection::Identify => OutboxErrorKind::Identify,
            PostRejection::UploadFailed => OutboxErrorKind::UploadFailed,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Offline: {0}")]
    Offline(String),

    #[error("Rejected by server ({reason:?}): {message}")]
    Rejected { reason: PostRejection, message: String },

    #[error("Server error: {0}")]
    Server(String),
}

/// Complete inbox listing returned by `sync_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullInbox {
    pub version: InboxVersion,
    pub conversations: Vec<Conversation>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Post a sealed message; the server assigns its id.
    async fn post(&self, conv_id: &ConversationId, boxed: &BoxedMessage) -> Result<ServerHeader, TransportError>;

    async fn get_thread(
        &self,
        conv_id: &ConversationId,
        pagination: &Pagination,
    ) -> Result<ThreadViewBoxed, TransportError>;

    /// Changes since `version`. Which variant comes back is the server's call.
    async fn sync_inbox(&self, version: InboxVersion) -> Result<SyncResult, TransportError>;

    async fn sync_all(&self) -> Result<FullInbox, TransportError>;
}
