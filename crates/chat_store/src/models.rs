//! Database row models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxRow {
    pub outbox_id: String,
    pub conv_id: String,
    pub ordinal: i64,
    /// `sending` | `error`
    pub state: String,
    /// `OutboxErrorKind` as string when `state = 'error'`.
    pub error_kind: Option<String>,
    pub ephemeral: bool,
    pub send_epoch: i64,
    pub ctime: DateTime<Utc>,
    /// Vault-encrypted JSON `OutboxRecord`
    pub record_enc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationRow {
    pub conv_id: String,
    /// JSON `Conversation`
    pub data: String,
    pub max_msg_id: i64,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxStateRow {
    pub version: i64,
    pub needs_refetch: bool,
}
