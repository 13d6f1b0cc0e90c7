//! Runtime configuration.

use std::env;
use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;

pub const DEFAULT_CACHE_MAX_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REFRESH_INITIAL_DELAY_SECS: u64 = 10;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512 * 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Configuration for one attached camera.
/// Priority: environment variables > settings file > defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CamfsConfig {
    /// Byte budget of the object content cache.
    pub cache_max_bytes: u64,
    /// Cached payloads of objects modified longer ago than this are dropped by cleanup.
    pub cache_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How often mounted volumes re-read their capacity.
    pub refresh_interval_secs: u64,
    pub refresh_initial_delay_secs: u64,
    /// Largest single receive requested from the transport.
    pub max_packet_size: usize,
    /// Block size reported by statfs.
    pub block_size: u32,
}

impl Default for CamfsConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            cache_timeout_secs: DEFAULT_CACHE_TIMEOUT_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            refresh_initial_delay_secs: DEFAULT_REFRESH_INITIAL_DELAY_SECS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl CamfsConfig {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Load configuration with priority: env vars > settings file > defaults.
    /// A missing file is not an error; an unreadable or malformed one is.
    pub fn from_settings_and_env(path: Option<&Path>) -> Result<Self, StorageError> {
        let base = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        Ok(base.with_overrides(|key| env::var(key).ok()))
    }

    /// Reads a JSON settings file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, StorageError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::io(format!("can't read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| StorageError::invalid_argument(format!("can't parse {}: {e}", path.display())))
    }

    /// Applies `CAMFS_*` overrides from `lookup`. Unparseable values are ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        override_field(&lookup, "CAMFS_CACHE_MAX_BYTES", &mut self.cache_max_bytes);
        override_field(&lookup, "CAMFS_CACHE_TIMEOUT_SECS", &mut self.cache_timeout_secs);
        override_field(&lookup, "CAMFS_CLEANUP_INTERVAL_SECS", &mut self.cleanup_interval_secs);
        override_field(&lookup, "CAMFS_REFRESH_INTERVAL_SECS", &mut self.refresh_interval_secs);
        override_field(&lookup, "CAMFS_REFRESH_INITIAL_DELAY_SECS", &mut self.refresh_initial_delay_secs);
        override_field(&lookup, "CAMFS_MAX_PACKET_SIZE", &mut self.max_packet_size);
        override_field(&lookup, "CAMFS_BLOCK_SIZE", &mut self.block_size);
        self
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn refresh_initial_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_initial_delay_secs)
    }
}

fn override_field<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *field = value,
        Err(_) => warn!("Ignoring {key}={raw:?}: not a valid value"),
    }
}
