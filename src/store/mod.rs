//! Persistent state store
//!
//! A flat key → JSON value mapping. Every persisted structure owns one key
//! and is written back as a whole value after each mutation:
//!
//! | Key | Value |
//! |-----|-------|
//! | `schedule` | [`crate::scheduler::schedule::ScheduleState`] |
//! | `rotation` | [`crate::scheduler::rotation::RotationState`] |
//! | `breaker.<name>` | [`crate::resilience::breaker::BreakerSnapshot`] |
//! | `blacklist` | sorted list of published content ids |
//!
//! Backends:
//!
//! - [`JsonFileStore`] - one JSON document, replaced atomically (temp file + rename)
//! - [`SqliteStore`] - one row per key
//! - [`MemoryStore`] - in-process, for tests and dry runs
//!
//! `set` is atomic from the caller's perspective: readers observe either the
//! previous or the new value, never a partial one. A failed `set` is reported
//! as [`StoreError`] and leaves the previous value in place.

mod file;
mod memory;
mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Well-known keys of the persisted layout
pub mod keys {
    /// Schedule timing state
    pub const SCHEDULE: &str = "schedule";
    /// Source rotation state
    pub const ROTATION: &str = "rotation";
    /// Published content ids
    pub const BLACKLIST: &str = "blacklist";
    /// Prefix of per-dependency circuit breaker keys
    pub const BREAKER_PREFIX: &str = "breaker.";

    /// Key for the named breaker
    pub fn breaker(name: &str) -> String {
        format!("{BREAKER_PREFIX}{name}")
    }
}

/// Errors raised by state store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be opened at startup
    #[error("failed to open state store at {path}: {reason}")]
    Open { path: String, reason: String },

    /// A read or write failed in the backend
    #[error("state store {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    /// A value could not be (de)serialized
    #[error("failed to (de)serialize value for key '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the operation may succeed on a later attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable key-value store with whole-value get/set
pub trait StateStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Replace the value stored under `key`
    fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Copy of every stored key and value
    fn snapshot(&self) -> StoreResult<BTreeMap<String, Value>>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Typed access on top of [`StateStore`]
pub trait StateStoreExt {
    /// Read and deserialize the value under `key`
    fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>>;

    /// Serialize and store `value` under `key`
    fn save<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()>;
}

impl<S: StateStore + ?Sized> StateStoreExt for S {
    fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.set(key, value)
    }
}

/// Shared store handle
pub type SharedStore = Arc<dyn StateStore>;

/// Storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single JSON document
    Json,
    /// SQLite database
    Sqlite,
    /// Process memory only
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

/// Open the configured backend
///
/// Failure here is fatal for startup: the caller must not continue without
/// a working store.
pub fn open_store(backend: StoreBackend, path: &Path) -> crate::error::Result<SharedStore> {
    let store: SharedStore = match backend {
        StoreBackend::Json => Arc::new(JsonFileStore::open(path)?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(path)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    tracing::info!(
        backend = store.backend_name(),
        path = %path.display(),
        "State store opened"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        interval: u64,
        label: String,
    }

    #[test]
    fn test_breaker_key_layout() {
        assert_eq!(keys::breaker("publisher"), "breaker.publisher");
    }

    #[test]
    fn test_typed_roundtrip_through_memory_store() {
        let store = MemoryStore::new();
        let sample = Sample {
            interval: 3600,
            label: "hourly".into(),
        };
        store.save("sample", &sample).unwrap();
        let loaded: Option<Sample> = store.load("sample").unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[test]
    fn test_load_missing_key_is_none() {
        let store = MemoryStore::new();
        let loaded: Option<Sample> = store.load("absent").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_wrong_shape_is_serialization_error() {
        let store = MemoryStore::new();
        store.set("sample", serde_json::json!([1, 2, 3])).unwrap();
        let err = store.load::<Sample>("sample").unwrap_err();
        assert!(matches!(err, StoreError::Serialization { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("JSON".parse::<StoreBackend>().unwrap(), StoreBackend::Json);
        assert_eq!("sqlite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
