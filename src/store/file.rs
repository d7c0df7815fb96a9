//! JSON document backend
//!
//! The whole key space lives in one JSON object. Every `set` rewrites the
//! document to `<path>.tmp` and renames it over `<path>`, so a crash leaves
//! either the old or the new document on disk.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use super::{StateStore, StoreError, StoreResult};

/// File-backed state store
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or create) the document at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let open_err = |reason: String| StoreError::Open {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| open_err(format!("cannot create directory: {e}")))?;
        }

        let entries = if path.exists() {
            let file = File::open(path).map_err(|e| open_err(e.to_string()))?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)
                .map_err(|e| open_err(format!("corrupt state document: {e}")))?
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), keys = entries.len(), "State document loaded");

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the document
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn write_document(&self, entries: &BTreeMap<String, Value>) -> StoreResult<()> {
        let temp_path = self.temp_path();

        let file = File::create(&temp_path).map_err(|e| {
            StoreError::backend("create", format!("{}: {e}", temp_path.display()))
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, entries)
            .map_err(|e| StoreError::backend("serialize", e))?;
        writer
            .flush()
            .map_err(|e| StoreError::backend("flush", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| StoreError::backend("sync", e))?;

        fs::rename(&temp_path, &self.path).map_err(|e| {
            StoreError::backend("rename", format!("{}: {e}", self.path.display()))
        })?;

        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut next = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        next.insert(key.to_string(), value);

        self.write_document(&next)?;

        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = next;
        tracing::trace!(key, path = %self.path.display(), "State value written");
        Ok(())
    }

    fn snapshot(&self) -> StoreResult<BTreeMap<String, Value>> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn backend_name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_set_then_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("schedule", json!({"interval_seconds": 3600})).unwrap();
        store.set("blacklist", json!(["a", "b"])).unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("schedule").unwrap(),
            Some(json!({"interval_seconds": 3600}))
        );
        assert_eq!(reopened.get("blacklist").unwrap(), Some(json!(["a", "b"])));
        assert!(!reopened.temp_path().exists());
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.set("k", json!(1)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_document_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::open(&path).err().unwrap();
        assert!(matches!(err, StoreError::Open { .. }));
    }

    #[test]
    fn test_failed_write_keeps_previous_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.set("k", json!("old")).unwrap();

        // A directory squatting on the temp path makes File::create fail.
        fs::create_dir(store.temp_path()).unwrap();
        let result = store.set("k", json!("new"));
        assert!(result.is_err());
        assert!(result.unwrap_err().is_recoverable());
        assert_eq!(store.get("k").unwrap(), Some(json!("old")));
    }

    #[test]
    fn test_snapshot_lists_all_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(&dir.path().join("s.json")).unwrap();
        store.set("rotation", json!({})).unwrap();
        store.set("schedule", json!({})).unwrap();
        let keys: Vec<_> = store.snapshot().unwrap().into_keys().collect();
        assert_eq!(keys, vec!["rotation", "schedule"]);
    }
}
