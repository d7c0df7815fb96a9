//! SQLite backend: one row per key

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::{StateStore, StoreError, StoreResult};

/// SQLite-backed state store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::with_connection(conn, &path.display().to_string())
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: ":memory:".into(),
            reason: e.to_string(),
        })?;
        Self::with_connection(conn, ":memory:")
    }

    fn with_connection(conn: Connection, label: &str) -> StoreResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StoreError::Open {
            path: label.to_string(),
            reason: format!("failed to create state_kv table: {e}"),
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM state_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::backend("get", e))?;

        raw.map(|text| {
            serde_json::from_str(&text).map_err(|source| StoreError::Serialization {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let text = serde_json::to_string(&value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO state_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::backend("set", e))?;
        Ok(())
    }

    fn snapshot(&self) -> StoreResult<BTreeMap<String, Value>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT key, value FROM state_kv ORDER BY key")
            .map_err(|e| StoreError::backend("snapshot", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| StoreError::backend("snapshot", e))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (key, text) = row.map_err(|e| StoreError::backend("snapshot", e))?;
            let value = serde_json::from_str(&text).map_err(|source| {
                StoreError::Serialization {
                    key: key.clone(),
                    source,
                }
            })?;
            out.insert(key, value);
        }
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
