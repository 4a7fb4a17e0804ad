//! Session layer configuration, loadable from TOML.
//!
//! ```toml
//! database_path = "/var/lib/app/sessions.db"
//! out_of_order = "tolerate"
//! max_skip = 500
//! bundle_fetch_timeout_ms = 3000
//! one_time_prekey_batch = 50
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ratchet::{OutOfOrderPolicy, RatchetEngine, DEFAULT_MAX_SKIP};

/// DEFAULT_BUNDLE_FETCH_TIMEOUT_MS bounds a directory lookup
pub const DEFAULT_BUNDLE_FETCH_TIMEOUT_MS: u64 = 5_000;
/// DEFAULT_ONE_TIME_PREKEY_BATCH is how many one-time pre-keys `Principal::publish_keys` generates
pub const DEFAULT_ONE_TIME_PREKEY_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Database file. None keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub out_of_order: OutOfOrderPolicy,
    /// Only consulted with `out_of_order = "tolerate"`
    pub max_skip: u32,
    pub bundle_fetch_timeout_ms: u64,
    pub one_time_prekey_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            out_of_order: OutOfOrderPolicy::default(),
            max_skip: DEFAULT_MAX_SKIP,
            bundle_fetch_timeout_ms: DEFAULT_BUNDLE_FETCH_TIMEOUT_MS,
            one_time_prekey_batch: DEFAULT_ONE_TIME_PREKEY_BATCH,
        }
    }
}

impl SessionConfig {
    /// in_memory is the default configuration; nothing touches disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn ratchet_engine(&self) -> RatchetEngine {
        RatchetEngine::new(self.out_of_order, self.max_skip)
    }

    pub fn bundle_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.bundle_fetch_timeout_ms)
    }
}

/* ------------------------------------------------------------------------- */

// TESTS
