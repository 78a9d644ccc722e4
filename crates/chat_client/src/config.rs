//! Client configuration.
//!
//! Read from `<data_dir>/config.json`; a missing file means defaults. A few
//! fields can be overridden from the environment:
//!
//! | variable                  | field               |
//! |---------------------------|---------------------|
//! | `CHAT_DB_PATH`            | `db_path`           |
//! | `CHAT_SEND_TIMEOUT_SECS`  | `send_timeout_secs` |
//! | `CHAT_MAX_SEND_ATTEMPTS`  | `max_send_attempts` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use chat_proto::PaddingMode;

use crate::error::ClientError;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "chat";

pub const CONFIG_FILE: &str = "config.json";
pub const DB_FILE: &str = "chat.db";

pub fn data_dir() -> Result<PathBuf, ClientError> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| ClientError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `None` means `<data_dir>/chat.db`.
    pub db_path: Option<PathBuf>,
    pub send_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub max_send_attempts: u32,
    /// Records still unsent after this long fail with `Expired`.
    pub message_expiry_mins: u64,
    pub error_purge_days: u64,
    pub ephemeral_purge_hours: u64,
    /// How often the delivery loop wakes without being nudged.
    pub deliver_interval_secs: u64,
    pub padding: PaddingMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            send_timeout_secs: 30,
            sync_timeout_secs: 30,
            max_send_attempts: 5,
            message_expiry_mins: 60,
            error_purge_days: 7,
            ephemeral_purge_hours: 24,
            deliver_interval_secs: 5,
            padding: PaddingMode::Buckets,
        }
    }
}

impl ClientConfig {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self, ClientError> {
        let path = data_dir()?.join(CONFIG_FILE);
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ClientError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ClientError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `CHAT_*` overrides read through `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("CHAT_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup("CHAT_SEND_TIMEOUT_SECS") {
            match raw.parse() {
                Ok(secs) => self.send_timeout_secs = secs,
                Err(_) => warn!(value = %raw, "ignoring invalid CHAT_SEND_TIMEOUT_SECS"),
            }
        }
        if let Some(raw) = lookup("CHAT_MAX_SEND_ATTEMPTS") {
            match raw.parse() {
                Ok(n) if n > 0 => self.max_send_attempts = n,
                _ => warn!(value = %raw, "ignoring invalid CHAT_MAX_SEND_ATTEMPTS"),
            }
        }
    }

    pub fn db_path(&self) -> Result<PathBuf, ClientError> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join(DB_FILE)),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn deliver_interval(&self) -> Duration {
        Duration::from_secs(self.deliver_interval_secs.max(1))
    }

    pub fn message_expiry(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.message_expiry_mins as i64)
    }

    pub fn error_purge_cutoff(&self) -> chrono::Duration {
        chrono::Duration::days(self.error_purge_days as i64)
    }

    pub fn ephemeral_purge_cutoff(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ephemeral_purge_hours as i64)
    }
}
