//! chat_client — orchestration on top of the store and the envelope codec
//!
//! # Modules
//! - `config`    — `ClientConfig` (JSON file + `CHAT_*` overrides)
//! - `logging`   — tracing subscriber bootstrap
//! - `transport` — the server collaborator trait
//! - `keys`      — sender-side key source
//! - `deliverer` — background outbox delivery
//! - `sync`      — single-flight inbox sync
//! - `thread`    — thread page loading

pub mod config;
pub mod deliverer;
pub mod error;
pub mod keys;
pub mod logging;
pub mod sync;
pub mod thread;
pub mod transport;

pub use config::ClientConfig;
pub use deliverer::{DeliveryConfig, DeliveryLoopHandle, DeliveryOutcome, Deliverer};
pub use error::{ClientError, SyncError};
pub use keys::{LocalKeys, SealingKeys};
pub use sync::{InboxSyncer, PushOutcome, SyncOutcome, SyncReport};
pub use thread::{ThreadLoad, ThreadLoader};
pub use transport::{ChatTransport, FullInbox, PostRejection, TransportError};
