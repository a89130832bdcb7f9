//! Configuration for the catalog client and the sync machinery.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) is valid. Durations use humantime syntax (`"2s"`,
//! `"500ms"`).
//!
//! ```toml
//! [catalog]
//! url = "https://example.supabase.co"
//! api_key = "…"
//!
//! [sync]
//! interval = "2s"
//! ```

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default catalog table name.
pub const DEFAULT_TABLE: &str = "file_locks";

/// Default cap on rows returned by a full fetch.
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Default reconciliation interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// Default timeout for the full catalog fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for insert/delete/rename.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for the last-accessed touch.
pub const DEFAULT_TOUCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatekeeperConfig {
    pub catalog: CatalogConfig,
    pub sync: SyncConfig,
}

impl GatekeeperConfig {
    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.interval.is_zero() {
            return Err(ConfigError::Invalid("sync.interval must be greater than zero".into()));
        }
        if self.sync.queue_capacity == 0 {
            return Err(ConfigError::Invalid("sync.queue_capacity must be at least 1".into()));
        }
        if self.sync.concurrency == 0 {
            return Err(ConfigError::Invalid("sync.concurrency must be at least 1".into()));
        }
        if self.catalog.table.trim().is_empty() {
            return Err(ConfigError::Invalid("catalog.table must not be empty".into()));
        }
        Ok(())
    }
}

/// Remote catalog connection settings.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Base URL of the catalog service, e.g. `https://project.supabase.co`.
    pub url: Option<String>,
    /// Table (resource) name.
    pub table: String,
    /// Value of the `apikey` header.
    pub api_key: Option<String>,
    /// Bearer token; falls back to `api_key` when unset.
    pub bearer_token: Option<String>,
    /// Maximum rows requested by a full fetch. `None` requests everything.
    pub row_limit: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub touch_timeout: Duration,
}

impl CatalogConfig {
    /// Token sent in the `Authorization` header.
    pub fn effective_bearer(&self) -> Option<&str> {
        self.bearer_token.as_deref().or(self.api_key.as_deref())
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: None,
            table: DEFAULT_TABLE.to_string(),
            api_key: None,
            bearer_token: None,
            row_limit: Some(DEFAULT_ROW_LIMIT),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            touch_timeout: DEFAULT_TOUCH_TIMEOUT,
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("CatalogConfig")
            .field("url", &self.url)
            .field("table", &self.table)
            .field("api_key", &redact(&self.api_key))
            .field("bearer_token", &redact(&self.bearer_token))
            .field("row_limit", &self.row_limit)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("touch_timeout", &self.touch_timeout)
            .finish()
    }
}

/// Reconciler and notifier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Delay between reconciliation cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Capacity of the notification queue. Events beyond it are dropped.
    pub queue_capacity: usize,
    /// Maximum concurrent inserts/deletes issued by one cycle.
    pub concurrency: usize,
    /// How long shutdown waits for queued notifications to drain.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            queue_capacity: 1024,
            concurrency: 8,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Parses a humantime duration such as `"2s"` or `"1m 30s"`.
///
/// Used for command-line overrides of the durations in this module.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let de = serde::de::value::StrDeserializer::<serde::de::value::Error>::new(text);
    humantime_serde::deserialize(de).map_err(|e| e.to_string())
}
