// src/config.rs

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

/// Settings of a [`crate::manager::DownloadManager`].
/// Every field has a default, so a config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Where finished books are written.
    pub download_dir: PathBuf,
    /// Number of concurrent transfers. One keeps downloads strictly serial.
    pub workers: usize,
    /// Bandwidth cap in bytes per second shared by all transfers, 0 = unlimited.
    pub rate_limit: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Mirror hosts tried first when a book has several links.
    pub preferred_mirrors: Vec<String>,
    /// SQLite file the task list is kept in across restarts.
    pub state_db: Option<PathBuf>,
    /// Capacity of the event channel; slow subscribers lose older events.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            workers: 1,
            rate_limit: 0,
            connect_timeout_secs: 30,
            user_agent: concat!("bookdl/", env!("CARGO_PKG_VERSION")).to_string(),
            preferred_mirrors: Vec::new(),
            state_db: None,
            event_capacity: 256,
        }
    }
}

impl ManagerConfig {
    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation("workers must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Validation("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
