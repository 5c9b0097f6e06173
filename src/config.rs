//! Store configuration.
//!
//! The configuration is optional: a missing file is reported as
//! [`KvError::ConfigMissing`] and turns the store into the Disabled state
//! instead of failing startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KvError, KvResult};
use crate::storage::BackendConfig;

pub const DEFAULT_BUCKET_SEPARATOR: &str = "/";
pub const DEFAULT_CACHE_SIZE_MB: u64 = 64;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

/// Configuration consumed by [`KvStore`](crate::KvStore).
///
/// Keys use kebab-case on disk:
///
/// ```json
/// { "db-path": "/var/lib/agent/kv", "bucket-separator": "/" }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    /// Location of the database.
    pub db_path: PathBuf,

    /// Separator splitting logical keys into nested buckets.
    /// An empty separator keeps every key in the root bucket.
    #[serde(default = "default_bucket_separator")]
    pub bucket_separator: String,

    /// Engine page cache size in megabytes.
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,

    /// Background flush interval in milliseconds, 0 disables periodic flushing.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_bucket_separator() -> String {
    DEFAULT_BUCKET_SEPARATOR.to_string()
}

fn default_cache_size_mb() -> u64 {
    DEFAULT_CACHE_SIZE_MB
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            bucket_separator: default_bucket_separator(),
            cache_size_mb: DEFAULT_CACHE_SIZE_MB,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.bucket_separator = separator.into();
        self
    }

    pub fn with_cache_size_mb(mut self, cache_size_mb: u64) -> Self {
        self.cache_size_mb = cache_size_mb;
        self
    }

    /// Reads a JSON configuration file.
    ///
    /// Returns [`KvError::ConfigMissing`] when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KvError::ConfigMissing(path.to_path_buf()));
            }
            Err(e) => return Err(KvError::Io(e)),
        };

        let config: StoreConfig = serde_json::from_str(&raw).map_err(|e| {
            KvError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;

        debug!(path = %path.display(), "Loaded store configuration");
        Ok(config)
    }

    pub fn validate(&self) -> KvResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(KvError::InvalidConfig("db-path must not be empty".to_string()));
        }

        if self.bucket_separator.contains('\0') {
            return Err(KvError::InvalidConfig(
                "bucket-separator must not contain a NUL byte".to_string(),
            ));
        }

        if self.cache_size_mb == 0 {
            return Err(KvError::InvalidConfig(
                "cache-size-mb must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            path: self.db_path.clone(),
            cache_size_mb: self.cache_size_mb,
            flush_interval_ms: self.flush_interval_ms,
        }
    }
}
