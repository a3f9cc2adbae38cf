//! Restart State
//!
//! The checkpoint is the position of the last fully handled event. The error
//! log is an append-only JSON-lines file of handler failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

/// Errors reading or writing restart state
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Position of an event in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block: u64,
    pub log_index: u64,
}

impl Checkpoint {
    #[must_use]
    pub fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }

    /// Whether an event at this position was already handled
    #[must_use]
    pub fn covers(&self, block: u64, log_index: u64) -> bool {
        (block, log_index) <= (self.block, self.log_index)
    }
}

/// Checkpoint persisted to a JSON file, or kept in memory only
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the last checkpoint, `None` if nothing was persisted yet
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        let checkpoint = serde_json::from_slice(&raw).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })?;
        Ok(Some(checkpoint))
    }

    /// Persist a checkpoint, replacing the previous one atomically
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };

        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec(&checkpoint).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;

        debug!(block = checkpoint.block, log_index = checkpoint.log_index, "Checkpoint saved");
        Ok(())
    }
}

/// One handler failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub block: u64,
    pub log_index: u64,
    pub error: String,
}

impl ErrorEntry {
    #[must_use]
    pub fn now(event: impl Into<String>, block: u64, log_index: u64, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            block,
            log_index,
            error: error.into(),
        }
    }
}

/// Durable JSON-lines error log
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    path: Option<PathBuf>,
}

impl ErrorLog {
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Record a failure. Always traced, appended to the file when configured.
    ///
    /// # Errors
    /// Returns error if the entry cannot be appended
    pub fn append(&self, entry: &ErrorEntry) -> Result<(), CheckpointError> {
        error!(
            event = %entry.event,
            block = entry.block,
            log_index = entry.log_index,
            error = %entry.error,
            "Handler failed"
        );

        let Some(path) = &self.path else {
            return Ok(());
        };

        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };

        let mut line = serde_json::to_string(entry).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }

    /// Read back all entries
    ///
    /// # Errors
    /// Returns error if the file cannot be read or a line cannot be parsed
    pub fn entries(&self) -> Result<Vec<ErrorEntry>, CheckpointError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| CheckpointError::Corrupt {
                    path: path.clone(),
                    source,
                })
            })
            .collect()
    }
}
