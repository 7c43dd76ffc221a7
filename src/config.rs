//! Engine configuration
//!
//! Loaded from `fleetsync.toml`, then overridden from the environment.
//!
//! ## Environment Variables
//!
//! - `FLEETSYNC_BASE_URL` - Server base URL
//! - `FLEETSYNC_DATA_DIR` - Directory holding the offline store
//! - `FLEETSYNC_SYNC_INTERVAL_SECS` - Periodic drain interval
//! - `FLEETSYNC_MAX_RETRIES` - Retry limit for failed operations (`0` or empty: unlimited)
//! - `FLEETSYNC_TOKEN` - Bearer token sent with every request
//!
//! These can be set in a `.env` file in the working directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::queue::{QueueLimits, RetryPolicy};

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "fleetsync.toml";

pub const ENV_BASE_URL: &str = "FLEETSYNC_BASE_URL";
pub const ENV_DATA_DIR: &str = "FLEETSYNC_DATA_DIR";
pub const ENV_SYNC_INTERVAL: &str = "FLEETSYNC_SYNC_INTERVAL_SECS";
pub const ENV_MAX_RETRIES: &str = "FLEETSYNC_MAX_RETRIES";
pub const ENV_TOKEN: &str = "FLEETSYNC_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL relative request paths are resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Path probed by the `run` loop to detect connectivity
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Short timeout for reads, so offline reads fall back to cache quickly
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// How long the background context waits for a foreground reply
    #[serde(default = "default_bridge_timeout_ms")]
    pub bridge_timeout_ms: u64,
    /// Messages buffered per detached foreground client
    #[serde(default = "default_bridge_backlog")]
    pub bridge_backlog: usize,
    /// Record id field used when reconciling the cache
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Field holding the operation id inside queued POST bodies
    #[serde(default = "default_temp_id_field")]
    pub temp_id_field: String,
    /// Initial connectivity assumption until a platform signal arrives
    #[serde(default = "default_start_online")]
    pub start_online: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub queue: QueueLimits,
}

fn default_base_url() -> String {
    "http://localhost:8080/api/".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./fleetsync-data")
}

fn default_health_path() -> String {
    "health".to_string()
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    15_000
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_bridge_timeout_ms() -> u64 {
    2_000
}

fn default_bridge_backlog() -> usize {
    128
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_temp_id_field() -> String {
    "tempId".to_string()
}

fn default_start_online() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            data_dir: default_data_dir(),
            auth_token: None,
            health_path: default_health_path(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            bridge_timeout_ms: default_bridge_timeout_ms(),
            bridge_backlog: default_bridge_backlog(),
            id_field: default_id_field(),
            temp_id_field: default_temp_id_field(),
            start_online: default_start_online(),
            event_capacity: default_event_capacity(),
            retry: RetryPolicy::default(),
            queue: QueueLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration.
    ///
    /// Reads `.env` if present, then `path` (or `fleetsync.toml` in the
    /// working directory when it exists), then applies environment overrides.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE_NAME).exists() => {
                Self::from_file(Path::new(CONFIG_FILE_NAME))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> SyncResult<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Apply overrides from `lookup` (the process environment in `load`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = url;
        }

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(secs) = lookup(ENV_SYNC_INTERVAL).and_then(|v| v.parse::<u64>().ok()) {
            self.sync_interval_secs = secs;
        }

        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            match raw.trim().parse::<u32>() {
                Ok(0) => self.retry.max_retries = None,
                Ok(n) => self.retry.max_retries = Some(n),
                Err(_) if raw.trim().is_empty() => self.retry.max_retries = None,
                Err(_) => tracing::warn!("Ignoring invalid {}={}", ENV_MAX_RETRIES, raw),
            }
        }

        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
            self.auth_token = Some(token);
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url must not be empty".to_string()));
        }
        crate::sync::resource::parse_base(&self.base_url)?;

        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(SyncError::Config("timeouts must be greater than zero".to_string()));
        }
        if self.sync_interval_secs == 0 || self.probe_interval_secs == 0 {
            return Err(SyncError::Config(
                "sync and probe intervals must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.retry.backoff_base > self.retry.backoff_cap {
            return Err(SyncError::Config(format!(
                "backoffBase ({}) exceeds backoffCap ({})",
                self.retry.backoff_base, self.retry.backoff_cap
            )));
        }
        if self.id_field.is_empty() || self.temp_id_field.is_empty() {
            return Err(SyncError::Config("id fields must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }
}
