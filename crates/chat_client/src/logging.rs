//! Tracing bootstrap.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "chat_client=info,chat_store=info,chat_proto=warn";

/// Install the fmt subscriber. `RUST_LOG` wins over the default filter.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .try_init();
}
