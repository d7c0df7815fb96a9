//! Source rotation
//!
//! Sources are kept in insertion order; that order is the rotation order.
//! The cursor points at the next position to try. [`RotationState::next_candidate`]
//! scans forward from the cursor, wrapping once, for the first active source,
//! and [`RotationState::advance`] moves the cursor just past whatever was
//! attempted, whether the attempt succeeded or not. With N active sources,
//! N consecutive attempts therefore visit every one of them exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::{SchedulerError, SchedulerResult};
use crate::store::{keys, SharedStore, StateStoreExt};

// ============================================================================
// Source Identifiers
// ============================================================================

/// Normalized source identifier
///
/// Trimmed, lowercased, without a leading `@`. Only ASCII letters, digits,
/// `_`, `-` and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        let normalized = raw.trim().trim_start_matches('@').to_lowercase();
        if normalized.is_empty() {
            return Err(SchedulerError::invalid_source_id(raw, "empty"));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(SchedulerError::invalid_source_id(
                raw,
                format!("unexpected character '{bad}'"),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SourceId {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

// ============================================================================
// Source Entries
// ============================================================================

/// Whether a source takes part in rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source in the rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub id: SourceId,
    pub status: SourceStatus,
    pub added_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl SourceEntry {
    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active
    }
}

/// Listing filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFilter {
    #[default]
    All,
    Active,
    Inactive,
}

impl SourceFilter {
    fn matches(&self, entry: &SourceEntry) -> bool {
        match self {
            Self::All => true,
            Self::Active => entry.status == SourceStatus::Active,
            Self::Inactive => entry.status == SourceStatus::Inactive,
        }
    }
}

impl FromStr for SourceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "active" | "activated" => Ok(Self::Active),
            "inactive" | "deactivated" => Ok(Self::Inactive),
            other => Err(format!("unknown source filter '{other}'")),
        }
    }
}

// ============================================================================
// Rotation State
// ============================================================================

/// Ordered sources plus the rotation cursor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub cursor: usize,
}

impl RotationState {
    fn position(&self, id: &SourceId) -> Option<usize> {
        self.sources.iter().position(|s| &s.id == id)
    }

    pub fn get(&self, id: &SourceId) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| &s.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_active()).count()
    }

    /// Reset an out-of-range cursor to 0; true if it had to be fixed
    pub fn clamp_cursor(&mut self) -> bool {
        if self.cursor != 0 && self.cursor >= self.sources.len() {
            self.cursor = 0;
            return true;
        }
        false
    }

    /// First active source at or after the cursor, wrapping once
    pub fn next_candidate(&self) -> Option<SourceId> {
        let len = self.sources.len();
        if len == 0 {
            return None;
        }
        let start = if self.cursor < len { self.cursor } else { 0 };
        (0..len)
            .map(|offset| &self.sources[(start + offset) % len])
            .find(|entry| entry.is_active())
            .map(|entry| entry.id.clone())
    }

    /// Move the cursor just past `attempted`
    ///
    /// If `attempted` was removed meanwhile the cursor is only clamped.
    pub fn advance(&mut self, attempted: &SourceId) {
        match self.position(attempted) {
            Some(pos) => self.cursor = (pos + 1) % self.sources.len(),
            None => {
                self.clamp_cursor();
            }
        }
    }

    /// Mark `id` active, appending it when new; true if it was added
    pub fn activate(&mut self, id: SourceId, now: DateTime<Utc>) -> bool {
        match self.sources.iter_mut().find(|s| s.id == id) {
            Some(entry) => {
                if entry.status != SourceStatus::Active {
                    entry.status = SourceStatus::Active;
                    entry.activated_at = Some(now);
                }
                false
            }
            None => {
                self.sources.push(SourceEntry {
                    id,
                    status: SourceStatus::Active,
                    added_at: now,
                    activated_at: Some(now),
                    deactivated_at: None,
                });
                true
            }
        }
    }

    pub fn deactivate(&mut self, id: &SourceId, now: DateTime<Utc>) -> SchedulerResult<()> {
        let entry = self
            .sources
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| SchedulerError::unknown_source(id.as_str()))?;
        if entry.status != SourceStatus::Inactive {
            entry.status = SourceStatus::Inactive;
            entry.deactivated_at = Some(now);
        }
        Ok(())
    }

    /// Drop a source; the cursor keeps pointing at the same successor
    pub fn remove(&mut self, id: &SourceId) -> SchedulerResult<SourceEntry> {
        let pos = self
            .position(id)
            .ok_or_else(|| SchedulerError::unknown_source(id.as_str()))?;
        let removed = self.sources.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        self.clamp_cursor();
        Ok(removed)
    }

    pub fn list(&self, filter: SourceFilter) -> Vec<SourceEntry> {
        self.sources
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Rotation Manager
// ============================================================================

/// Owner of [`RotationState`] with write-back persistence
pub struct RotationManager {
    state: RotationState,
    store: SharedStore,
    persisted: bool,
}

impl RotationManager {
    /// Load persisted rotation state or start empty
    pub fn load(store: SharedStore) -> SchedulerResult<Self> {
        let mut state = store
            .load::<RotationState>(keys::ROTATION)
            .map_err(|e| SchedulerError::persistence(keys::ROTATION, &e))?
            .unwrap_or_default();

        if state.clamp_cursor() {
            tracing::warn!("Persisted rotation cursor out of range, reset to 0");
        }

        tracing::info!(
            sources = state.sources.len(),
            active = state.active_count(),
            cursor = state.cursor,
            "Rotation state loaded"
        );

        Ok(Self {
            state,
            store,
            persisted: true,
        })
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    fn persist(&mut self) -> SchedulerResult<()> {
        match self.store.save(keys::ROTATION, &self.state) {
            Ok(()) => {
                self.persisted = true;
                Ok(())
            }
            Err(e) => {
                self.persisted = false;
                tracing::error!(key = keys::ROTATION, error = %e, "Failed to persist rotation state");
                Err(SchedulerError::persistence(keys::ROTATION, &e))
            }
        }
    }

    pub fn flush(&mut self) -> SchedulerResult<()> {
        if self.persisted {
            return Ok(());
        }
        self.persist()
    }

    /// Next source to attempt, repairing a stale cursor first
    pub fn next_candidate(&mut self) -> Option<SourceId> {
        if self.state.clamp_cursor() {
            tracing::warn!("Rotation cursor out of range, reset to 0");
            let _ = self.persist();
        }
        self.state.next_candidate()
    }

    pub fn advance(&mut self, attempted: &SourceId) -> SchedulerResult<()> {
        self.state.advance(attempted);
        tracing::debug!(source = %attempted, cursor = self.state.cursor, "Rotation advanced");
        self.persist()
    }

    pub fn activate(&mut self, id: SourceId, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let added = self.state.activate(id.clone(), now);
        tracing::info!(source = %id, added, "Source activated");
        self.persist()?;
        Ok(added)
    }

    pub fn deactivate(&mut self, id: &SourceId, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.state.deactivate(id, now)?;
        tracing::info!(source = %id, "Source deactivated");
        self.persist()
    }

    pub fn remove(&mut self, id: &SourceId) -> SchedulerResult<SourceEntry> {
        let removed = self.state.remove(id)?;
        tracing::info!(source = %id, "Source removed");
        self.persist()?;
        Ok(removed)
    }

    pub fn list(&self, filter: SourceFilter) -> Vec<SourceEntry> {
        self.state.list(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StateStore};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    fn id(s: &str) -> SourceId {
        SourceId::parse(s).unwrap()
    }

    fn rotation(names: &[&str]) -> RotationState {
        let mut state = RotationState::default();
        for name in names {
            state.activate(id(name), now());
        }
        state
    }

    #[test]
    fn test_source_id_normalization() {
        assert_eq!(id("  @WorldNews ").as_str(), "worldnews");
        assert!(SourceId::parse("").is_err());
        assert!(SourceId::parse("@").is_err());
        assert!(SourceId::parse("bad name").is_err());
        assert!(SourceId::parse("ok_name-1.x").is_ok());
    }

    #[test]
    fn test_no_duplicates_on_activate() {
        let mut state = rotation(&["a", "b"]);
        assert!(!state.activate(id("A"), now()));
        assert_eq!(state.sources.len(), 2);
    }

    #[test]
    fn test_round_robin_order() {
        let mut state = rotation(&["a", "b", "c"]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let candidate = state.next_candidate().unwrap();
            state.advance(&candidate);
            seen.push(candidate.to_string());
        }
        assert_eq!(seen, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_inactive_sources_skipped() {
        let mut state = rotation(&["a", "b", "c"]);
        state.deactivate(&id("b"), now()).unwrap();
        state.cursor = 1;
        assert_eq!(state.next_candidate(), Some(id("c")));
        state.advance(&id("c"));
        assert_eq!(state.cursor, 0);
        assert_eq!(state.next_candidate(), Some(id("a")));
    }

    #[test]
    fn test_no_active_sources_yields_none() {
        let mut state = rotation(&["only"]);
        state.deactivate(&id("only"), now()).unwrap();
        assert_eq!(state.next_candidate(), None);
        assert_eq!(RotationState::default().next_candidate(), None);
    }

    #[test]
    fn test_cursor_clamped_after_out_of_range() {
        let mut state = rotation(&["a", "b"]);
        state.cursor = 9;
        assert_eq!(state.next_candidate(), Some(id("a")));
        assert!(state.clamp_cursor());
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn test_remove_keeps_successor() {
        let mut state = rotation(&["a", "b", "c"]);
        state.cursor = 2;
        state.remove(&id("a")).unwrap();
        assert_eq!(state.cursor, 1);
        assert_eq!(state.next_candidate(), Some(id("c")));

        state.remove(&id("c")).unwrap();
        assert_eq!(state.cursor, 0);
        assert!(state.remove(&id("zzz")).is_err());
    }

    #[test]
    fn test_advance_past_removed_source_clamps() {
        let mut state = rotation(&["a", "b"]);
        state.cursor = 1;
        state.remove(&id("b")).unwrap();
        state.advance(&id("b"));
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn test_activation_timestamps() {
        let mut state = rotation(&["a"]);
        let later = now() + chrono::Duration::hours(1);
        state.deactivate(&id("a"), later).unwrap();
        assert_eq!(state.get(&id("a")).unwrap().deactivated_at, Some(later));
        state.activate(id("a"), later + chrono::Duration::hours(1));
        let entry = state.get(&id("a")).unwrap();
        assert!(entry.is_active());
        assert_eq!(entry.added_at, now());
        assert_eq!(entry.activated_at, Some(later + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_list_filters() {
        let mut state = rotation(&["a", "b", "c"]);
        state.deactivate(&id("b"), now()).unwrap();
        let active: Vec<_> = state.list(SourceFilter::Active).into_iter().map(|e| e.id).collect();
        assert_eq!(active, vec![id("a"), id("c")]);
        assert_eq!(state.list(SourceFilter::Inactive).len(), 1);
        assert_eq!(state.list(SourceFilter::All).len(), 3);
        assert_eq!("activated".parse::<SourceFilter>().unwrap(), SourceFilter::Active);
    }

    #[test]
    fn test_manager_persists_and_reloads() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut manager = RotationManager::load(Arc::clone(&store)).unwrap();
        manager.activate(id("a"), now()).unwrap();
        manager.activate(id("b"), now()).unwrap();
        let first = manager.next_candidate().unwrap();
        manager.advance(&first).unwrap();

        assert!(store.get(keys::ROTATION).unwrap().is_some());
        let reloaded = RotationManager::load(store).unwrap();
        assert_eq!(reloaded.state().cursor, 1);
        assert_eq!(reloaded.state().sources.len(), 2);
    }

    #[test]
    fn test_manager_repairs_persisted_cursor() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut broken = rotation(&["a"]);
        broken.cursor = 5;
        store.save(keys::ROTATION, &broken).unwrap();

        let manager = RotationManager::load(store).unwrap();
        assert_eq!(manager.state().cursor, 0);
    }

    proptest! {
        #[test]
        fn prop_every_active_source_once_per_round(
            total in 1usize..12,
            inactive_mask in proptest::collection::vec(any::<bool>(), 12),
            start in 0usize..12,
        ) {
            let names: Vec<String> = (0..total).map(|i| format!("src{i}")).collect();
            let mut state = RotationState::default();
            for name in &names {
                state.activate(id(name), now());
            }
            for (i, name) in names.iter().enumerate() {
                if inactive_mask[i] {
                    state.deactivate(&id(name), now()).unwrap();
                }
            }
            state.cursor = start % total;

            let active = state.active_count();
            let mut seen = HashSet::new();
            for _ in 0..active {
                let candidate = state.next_candidate().unwrap();
                prop_assert!(seen.insert(candidate.clone()), "{} attempted twice", candidate);
                state.advance(&candidate);
            }
            prop_assert_eq!(seen.len(), active);
        }
    }
}
