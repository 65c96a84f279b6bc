//! Key-value preferences
//!
//! Small flags that must survive restarts, stored as one JSON object.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::storage::StorageError;

/// File-backed key-value store. Every write is flushed to disk immediately.
#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl Preferences {
    /// Open the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match read_values(&path) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!("Failed to read preferences {:?}, starting empty: {}", path, e);
                BTreeMap::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.lock().get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Persist `value`; memory only changes once the file is written
    pub fn set_bool(&self, key: &str, value: bool) -> Result<(), StorageError> {
        let mut values = self.lock();
        let mut updated = values.clone();
        updated.insert(key.to_string(), Value::Bool(value));
        write_values(&self.path, &updated)?;
        *values = updated;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        // A panic while holding the lock cannot leave the map half-written
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_values(path: &Path) -> Result<BTreeMap<String, Value>, StorageError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn write_values(path: &Path, values: &BTreeMap<String, Value>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(values)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::open(dir.path().join("prefs.json"));
        assert!(!prefs.get_bool("model_ready_v1"));
    }

    #[test]
    fn test_flag_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");

        let prefs = Preferences::open(&path);
        prefs.set_bool("model_ready_v1", true).unwrap();
        drop(prefs);

        let reopened = Preferences::open(&path);
        assert!(reopened.get_bool("model_ready_v1"));

        reopened.set_bool("model_ready_v1", false).unwrap();
        assert!(!Preferences::open(&path).get_bool("model_ready_v1"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "{not json").unwrap();

        let prefs = Preferences::open(&path);
        assert!(!prefs.get_bool("model_ready_v1"));
        prefs.set_bool("model_ready_v1", true).unwrap();
        assert!(Preferences::open(&path).get_bool("model_ready_v1"));
    }

    #[test]
    fn test_failed_write_leaves_value_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail
        let path = dir.path().join("prefs.json");
        fs::create_dir_all(&path).unwrap();

        let prefs = Preferences::open(&path);
        assert!(prefs.set_bool("model_ready_v1", true).is_err());
        assert!(!prefs.get_bool("model_ready_v1"));
    }
}
