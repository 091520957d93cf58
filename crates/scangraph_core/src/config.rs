//! Store configuration.
//!
//! # Responsibility
//! - Describe pool, timeout, batching, retry and maintenance tunables.
//! - Load them from JSON with defaults for every omitted field.
//!
//! # Invariants
//! - Unknown fields are rejected.
//! - A config returned by `from_json_str`/`load_from_path` passed `validate`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub default_query_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub batch_size: usize,
    pub max_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Keep the caller's `last_updated` instead of stamping the write time.
    pub no_update_timestamps: bool,
    /// Grace period before an orphaned CVE may be purged.
    pub orphan_retention_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout_ms: 5_000,
            default_query_timeout_ms: 60_000,
            busy_timeout_ms: 5_000,
            batch_size: 500,
            max_retry_attempts: 3,
            retry_backoff_ms: 25,
            no_update_timestamps: false,
            orphan_retention_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.default_query_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_query_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}
