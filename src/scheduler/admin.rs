//! Administrative operations
//!
//! The operator-facing surface over a [`SchedulerContext`]. Every mutation
//! takes the owning manager's write lock, applies the change and persists it
//! before releasing, so a tick never sees half of an admin change. Queries
//! read in-memory state only and never wait on a dependency.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::context::{Phase, SchedulerContext};
use super::error::SchedulerResult;
use super::presence::{derive_presence, Presence};
use super::rotation::{SourceEntry, SourceFilter, SourceId};
use crate::resilience::{BreakerStats, RateLimiterStats};

/// Answer to a status query
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// `maintenance`, `just_completed` or `counting_down`
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub display: String,
    pub phase: Phase,
    pub interval_seconds: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub next_due_time: Option<DateTime<Utc>>,
    pub force_pending: bool,
    pub maintenance: bool,
    pub in_startup_grace: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_source: Option<String>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub persistence_healthy: bool,
}

/// Admin handle; cheap to clone
#[derive(Clone)]
pub struct Admin {
    ctx: Arc<SchedulerContext>,
}

impl Admin {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    pub async fn get_status(&self) -> StatusReport {
        let now = self.ctx.now();
        let window = chrono::Duration::seconds(self.ctx.settings.just_posted_window_secs as i64);
        let schedule = self.ctx.schedule.read().await.state().clone();
        let run = self.ctx.run_status.read().await.clone();
        let persistence_healthy = self.ctx.persistence_healthy().await;

        let presence = derive_presence(&schedule, now, window);
        let (seconds_remaining, reason) = match &presence {
            Presence::CountingDown { seconds_remaining } => (Some(*seconds_remaining), None),
            Presence::Maintenance { reason } => (None, Some(reason.clone())),
            Presence::JustCompleted => (None, None),
        };

        StatusReport {
            mode: presence.mode().to_string(),
            seconds_remaining,
            reason,
            display: presence.display(),
            phase: run.phase,
            interval_seconds: schedule.interval_seconds,
            last_success_time: schedule.last_success_time,
            next_due_time: schedule.next_due_time(),
            force_pending: schedule.force_flag,
            maintenance: schedule.maintenance,
            in_startup_grace: schedule.in_grace(now),
            last_attempt_at: run.last_attempt_at,
            last_source: run.last_source.map(String::from),
            last_outcome: run.last_outcome,
            last_error: run.last_error,
            persistence_healthy,
        }
    }

    /// Set the posting interval; 0 disables automation
    pub async fn set_interval(&self, seconds: u64) -> SchedulerResult<()> {
        self.ctx.schedule.write().await.set_interval(seconds)?;
        tracing::info!(interval_secs = seconds, "Posting interval changed");
        Ok(())
    }

    /// Make the next eligible tick due regardless of the interval
    pub async fn force_next_cycle(&self) -> SchedulerResult<()> {
        self.ctx.schedule.write().await.request_force()?;
        tracing::info!("Next cycle forced");
        Ok(())
    }

    pub async fn set_maintenance(&self, enabled: bool) -> SchedulerResult<()> {
        self.ctx.schedule.write().await.set_maintenance(enabled)?;
        tracing::info!(enabled, "Maintenance mode changed");
        Ok(())
    }

    pub async fn list_sources(&self, filter: SourceFilter) -> Vec<SourceEntry> {
        self.ctx.rotation.read().await.list(filter)
    }

    /// Activate a source, adding it when unknown; true if it was added
    pub async fn activate_source(&self, raw_id: &str) -> SchedulerResult<bool> {
        let id = SourceId::parse(raw_id)?;
        let now = self.ctx.now();
        self.ctx.rotation.write().await.activate(id, now)
    }

    pub async fn deactivate_source(&self, raw_id: &str) -> SchedulerResult<()> {
        let id = SourceId::parse(raw_id)?;
        let now = self.ctx.now();
        self.ctx.rotation.write().await.deactivate(&id, now)
    }

    pub async fn remove_source(&self, raw_id: &str) -> SchedulerResult<SourceEntry> {
        let id = SourceId::parse(raw_id)?;
        self.ctx.rotation.write().await.remove(&id)
    }

    pub fn get_breaker_stats(&self, dependency: &str) -> Option<BreakerStats> {
        self.ctx.breakers.stats(dependency)
    }

    pub fn all_breaker_stats(&self) -> Vec<BreakerStats> {
        self.ctx.breakers.all_stats()
    }

    /// Close a breaker by hand; false if no such breaker
    pub fn reset_breaker(&self, dependency: &str) -> bool {
        let reset = self.ctx.breakers.reset(dependency);
        if reset {
            tracing::info!(dependency, "Circuit breaker reset by operator");
        }
        reset
    }

    pub fn get_rate_limiter_stats(&self, dependency: &str) -> RateLimiterStats {
        self.ctx.limiter.stats(dependency)
    }

    /// Forget every published id; returns how many were dropped
    pub async fn clear_blacklist(&self) -> SchedulerResult<usize> {
        self.ctx.blacklist.write().await.clear()
    }
}
