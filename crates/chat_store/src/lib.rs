//! chat_store — encrypted local persistence for the chat client
//!
//! # Encryption strategy
//! SQLite does not encrypt. Outbox records hold plaintext the user has not
//! sent yet, so they are stored as XChaCha20-Poly1305 ciphertext under the
//! vault key (Argon2id over the user password, held in memory only while
//! unlocked). Ordering and purge columns (conversation, ordinal, state,
//! timestamps) stay in plaintext for queries.
//!
//! The inbox cache holds server-visible conversation metadata and is stored
//! as JSON.
//!
//! # Migration
//! SQLx migrations in `migrations/` run on every open.

pub mod db;
pub mod error;
pub mod inbox;
pub mod models;
pub mod outbox;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use inbox::Inbox;
pub use outbox::Outbox;
pub use vault::Vault;
