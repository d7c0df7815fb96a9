//! Posting schedule state
//!
//! [`ScheduleState`] holds the timing fields and answers "is a cycle due?".
//! [`ScheduleManager`] owns it, applies mutations and writes the whole value
//! back under the `schedule` key after each one.
//!
//! `next_due_time` is always derived from `last_success_time + interval`; the
//! only way to be due earlier is the one-shot force flag.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{SchedulerError, SchedulerResult};
use crate::store::{keys, SharedStore, StateStoreExt};

// ============================================================================
// Schedule State
// ============================================================================

/// Timing state of the posting loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Seconds between successful posts; 0 disables automation
    #[serde(default)]
    pub interval_seconds: u64,

    /// Time of the last successful post
    #[serde(default)]
    pub last_success_time: Option<DateTime<Utc>>,

    /// One-shot "post now" override
    #[serde(default)]
    pub force_flag: bool,

    /// Operator-declared maintenance (display only)
    #[serde(default)]
    pub maintenance: bool,

    /// Process start; never persisted
    #[serde(skip)]
    pub startup_time: DateTime<Utc>,

    /// Quiet period after start; never persisted
    #[serde(skip)]
    pub startup_grace_seconds: u64,
}

/// Outcome of a due check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueDecision {
    /// Still inside the startup quiet period
    InGrace { remaining_secs: i64 },
    /// Automation disabled (interval 0)
    Disabled,
    /// Interval not yet elapsed
    NotDue { remaining_secs: i64 },
    /// A cycle should run now
    Due { forced: bool },
}

impl DueDecision {
    pub fn is_due(&self) -> bool {
        matches!(self, Self::Due { .. })
    }
}

impl ScheduleState {
    /// Fresh state: automation disabled, nothing posted yet
    pub fn new(startup_time: DateTime<Utc>, startup_grace_seconds: u64) -> Self {
        Self {
            interval_seconds: 0,
            last_success_time: None,
            force_flag: false,
            maintenance: false,
            startup_time,
            startup_grace_seconds,
        }
    }

    /// `last_success_time + interval`, if both are meaningful
    pub fn next_due_time(&self) -> Option<DateTime<Utc>> {
        if self.interval_seconds == 0 {
            return None;
        }
        self.last_success_time
            .map(|last| last + Duration::seconds(self.interval_seconds as i64))
    }

    /// End of the startup quiet period
    pub fn grace_ends_at(&self) -> DateTime<Utc> {
        self.startup_time + Duration::seconds(self.startup_grace_seconds as i64)
    }

    pub fn in_grace(&self, now: DateTime<Utc>) -> bool {
        now < self.grace_ends_at()
    }

    /// Decide whether a cycle is due at `now`
    ///
    /// Grace beats everything including the force flag; a disabled interval
    /// beats the force flag too. Neither consumes the flag.
    pub fn evaluate(&self, now: DateTime<Utc>) -> DueDecision {
        if self.in_grace(now) {
            return DueDecision::InGrace {
                remaining_secs: (self.grace_ends_at() - now).num_seconds().max(0),
            };
        }
        if self.interval_seconds == 0 {
            return DueDecision::Disabled;
        }
        if self.force_flag {
            return DueDecision::Due { forced: true };
        }
        match self.next_due_time() {
            None => DueDecision::Due { forced: false },
            Some(due) if now >= due => DueDecision::Due { forced: false },
            Some(due) => DueDecision::NotDue {
                remaining_secs: (due - now).num_seconds().max(0),
            },
        }
    }

    /// Seconds until the next due time, clamped at zero
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.next_due_time()
            .map(|due| (due - now).num_seconds().max(0))
    }
}

// ============================================================================
// Schedule Manager
// ============================================================================

/// Owner of [`ScheduleState`] with write-back persistence
pub struct ScheduleManager {
    state: ScheduleState,
    store: SharedStore,
    persisted: bool,
}

impl ScheduleManager {
    /// Load the persisted schedule, or start from defaults
    pub fn load(
        store: SharedStore,
        startup_time: DateTime<Utc>,
        startup_grace_seconds: u64,
    ) -> SchedulerResult<Self> {
        let mut state = store
            .load::<ScheduleState>(keys::SCHEDULE)
            .map_err(|e| SchedulerError::persistence(keys::SCHEDULE, &e))?
            .unwrap_or_else(|| ScheduleState::new(startup_time, startup_grace_seconds));
        state.startup_time = startup_time;
        state.startup_grace_seconds = startup_grace_seconds;

        tracing::info!(
            interval_secs = state.interval_seconds,
            last_success = ?state.last_success_time,
            grace_secs = startup_grace_seconds,
            "Schedule state loaded"
        );

        Ok(Self {
            state,
            store,
            persisted: true,
        })
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Whether the latest mutation reached the store
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    fn persist(&mut self) -> SchedulerResult<()> {
        match self.store.save(keys::SCHEDULE, &self.state) {
            Ok(()) => {
                self.persisted = true;
                Ok(())
            }
            Err(e) => {
                self.persisted = false;
                tracing::error!(key = keys::SCHEDULE, error = %e, "Failed to persist schedule state");
                Err(SchedulerError::persistence(keys::SCHEDULE, &e))
            }
        }
    }

    /// Retry a write that failed earlier
    pub fn flush(&mut self) -> SchedulerResult<()> {
        if self.persisted {
            return Ok(());
        }
        self.persist()
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> DueDecision {
        self.state.evaluate(now)
    }

    /// Clear the force flag if set; true when it was consumed
    pub fn consume_force(&mut self) -> SchedulerResult<bool> {
        if !self.state.force_flag {
            return Ok(false);
        }
        self.state.force_flag = false;
        self.persist()?;
        Ok(true)
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.state.last_success_time = Some(now);
        self.persist()
    }

    pub fn set_interval(&mut self, seconds: u64) -> SchedulerResult<()> {
        self.state.interval_seconds = seconds;
        self.persist()
    }

    pub fn request_force(&mut self) -> SchedulerResult<()> {
        self.state.force_flag = true;
        self.persist()
    }

    pub fn set_maintenance(&mut self, enabled: bool) -> SchedulerResult<()> {
        self.state.maintenance = enabled;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StateStore};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
    }

    fn state(interval: u64, grace: u64) -> ScheduleState {
        let mut s = ScheduleState::new(t0(), grace);
        s.interval_seconds = interval;
        s
    }

    #[test]
    fn test_grace_overrides_force() {
        let mut s = state(3600, 120);
        s.force_flag = true;
        assert_eq!(
            s.evaluate(t0() + Duration::seconds(30)),
            DueDecision::InGrace { remaining_secs: 90 }
        );
        assert_eq!(
            s.evaluate(t0() + Duration::seconds(120)),
            DueDecision::Due { forced: true }
        );
    }

    #[test]
    fn test_disabled_interval() {
        let mut s = state(0, 0);
        s.force_flag = true;
        assert_eq!(s.evaluate(t0()), DueDecision::Disabled);
        assert!(s.next_due_time().is_none());
    }

    #[test]
    fn test_never_posted_is_due() {
        let s = state(3600, 0);
        assert_eq!(s.evaluate(t0()), DueDecision::Due { forced: false });
    }

    #[test]
    fn test_interval_respected() {
        let mut s = state(3600, 0);
        s.last_success_time = Some(t0());
        assert_eq!(
            s.evaluate(t0() + Duration::seconds(60)),
            DueDecision::NotDue { remaining_secs: 3540 }
        );
        assert!(s.evaluate(t0() + Duration::seconds(3600)).is_due());
    }

    #[test]
    fn test_seconds_remaining_clamped() {
        let mut s = state(60, 0);
        s.last_success_time = Some(t0());
        assert_eq!(s.seconds_remaining(t0() + Duration::hours(5)), Some(0));
    }

    #[test]
    fn test_startup_fields_not_persisted() {
        let s = state(60, 300);
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("startup_time").is_none());
        assert!(json.get("startup_grace_seconds").is_none());
        assert_eq!(json["interval_seconds"], 60);
    }

    #[test]
    fn test_manager_persists_each_mutation() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut manager = ScheduleManager::load(Arc::clone(&store), t0(), 0).unwrap();

        manager.set_interval(7200).unwrap();
        manager.request_force().unwrap();
        let saved = store.get(keys::SCHEDULE).unwrap().unwrap();
        assert_eq!(saved["interval_seconds"], 7200);
        assert_eq!(saved["force_flag"], true);

        assert!(manager.consume_force().unwrap());
        assert!(!manager.consume_force().unwrap());

        let reloaded = ScheduleManager::load(store, t0() + Duration::days(1), 60).unwrap();
        assert_eq!(reloaded.state().interval_seconds, 7200);
        assert!(!reloaded.state().force_flag);
        assert_eq!(reloaded.state().startup_grace_seconds, 60);
    }

    #[test]
    fn test_failed_write_keeps_memory_state() {
        let mem = Arc::new(MemoryStore::new());
        let store: SharedStore = mem.clone();
        let mut manager = ScheduleManager::load(store, t0(), 0).unwrap();

        mem.set_fail_writes(true);
        assert!(manager.set_interval(900).is_err());
        assert_eq!(manager.state().interval_seconds, 900);
        assert!(!manager.is_persisted());

        mem.set_fail_writes(false);
        manager.flush().unwrap();
        assert!(manager.is_persisted());
        assert_eq!(mem.get(keys::SCHEDULE).unwrap().unwrap()["interval_seconds"], 900);
    }
}
