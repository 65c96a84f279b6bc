//! Persistent storage
//!
//! This module handles all data persistence: settings, the model asset and its
//! readiness flag, and saved conversations.

pub mod conversations;
pub mod download;
pub mod models;
pub mod prefs;
pub mod settings;

use std::path::PathBuf;

use directories::ProjectDirs;
use thiserror::Error;

/// Overrides the platform data directory when set
pub const DATA_DIR_ENV: &str = "ASSISTANT_DATA_DIR";

/// Errors from local persistence
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine the application data directory")]
    NoDataDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// App-private data directory
///
/// `ASSISTANT_DATA_DIR` wins over the platform location.
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    ProjectDirs::from("org", "offline-assistant", "offline-assistant")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
