//! Already-published content ids
//!
//! Grows without bound until an operator clears it. Persisted as a sorted
//! list under the `blacklist` key after every change.

use std::collections::BTreeSet;

use super::error::{SchedulerError, SchedulerResult};
use crate::store::{keys, SharedStore, StateStoreExt};

/// Persisted set of published content ids
pub struct Blacklist {
    ids: BTreeSet<String>,
    store: SharedStore,
    persisted: bool,
}

impl Blacklist {
    pub fn load(store: SharedStore) -> SchedulerResult<Self> {
        let ids = store
            .load::<BTreeSet<String>>(keys::BLACKLIST)
            .map_err(|e| SchedulerError::persistence(keys::BLACKLIST, &e))?
            .unwrap_or_default();
        tracing::info!(entries = ids.len(), "Blacklist loaded");
        Ok(Self {
            ids,
            store,
            persisted: true,
        })
    }

    fn persist(&mut self) -> SchedulerResult<()> {
        match self.store.save(keys::BLACKLIST, &self.ids) {
            Ok(()) => {
                self.persisted = true;
                Ok(())
            }
            Err(e) => {
                self.persisted = false;
                tracing::error!(key = keys::BLACKLIST, error = %e, "Failed to persist blacklist");
                Err(SchedulerError::persistence(keys::BLACKLIST, &e))
            }
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn flush(&mut self) -> SchedulerResult<()> {
        if self.persisted {
            return Ok(());
        }
        self.persist()
    }

    pub fn is_blacklisted(&self, content_id: &str) -> bool {
        self.ids.contains(content_id)
    }

    /// Record a published id; a repeat add does not rewrite the store
    pub fn add(&mut self, content_id: impl Into<String>) -> SchedulerResult<()> {
        if self.ids.insert(content_id.into()) || !self.persisted {
            self.persist()?;
        }
        Ok(())
    }

    /// Forget every id; returns how many were dropped
    pub fn clear(&mut self) -> SchedulerResult<usize> {
        let dropped = self.ids.len();
        self.ids.clear();
        self.persist()?;
        tracing::info!(dropped, "Blacklist cleared");
        Ok(dropped)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonFileStore, MemoryStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_membership_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store: SharedStore = Arc::new(JsonFileStore::open(&path).unwrap());
            let mut blacklist = Blacklist::load(store).unwrap();
            blacklist.add("msg-1").unwrap();
            blacklist.add("msg-2").unwrap();
        }
        let store: SharedStore = Arc::new(JsonFileStore::open(&path).unwrap());
        let blacklist = Blacklist::load(store).unwrap();
        assert!(blacklist.is_blacklisted("msg-1"));
        assert!(blacklist.is_blacklisted("msg-2"));
        assert!(!blacklist.is_blacklisted("msg-3"));
    }

    #[test]
    fn test_clear() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut blacklist = Blacklist::load(store).unwrap();
        blacklist.add("a").unwrap();
        blacklist.add("a").unwrap();
        assert_eq!(blacklist.len(), 1);
        assert_eq!(blacklist.clear().unwrap(), 1);
        assert!(blacklist.is_empty());
    }

    #[test]
    fn test_repeat_add_retries_failed_write() {
        let mem = Arc::new(MemoryStore::new());
        let mut blacklist = Blacklist::load(mem.clone()).unwrap();
        mem.set_fail_writes(true);
        assert!(blacklist.add("x").is_err());
        assert!(blacklist.is_blacklisted("x"));

        mem.set_fail_writes(false);
        blacklist.add("x").unwrap();
        assert!(blacklist.is_persisted());
    }
}
