//! Shared scheduler state
//!
//! One [`SchedulerContext`] is built at startup and handed (behind an `Arc`)
//! to the orchestrator, the presence reporter and the admin surface. Locks
//! on the persisted structures are only ever held across synchronous
//! mutations, never across a pipeline call or a rate-limit wait.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::blacklist::Blacklist;
use super::error::SchedulerError;
use super::rotation::{RotationManager, SourceId};
use super::schedule::ScheduleManager;
use crate::clock::SharedClock;
use crate::config::{Config, SchedulerConfig};
use crate::notifications::SharedNotifier;
use crate::pipeline::SharedPipeline;
use crate::resilience::{BreakerRegistry, RateLimiter};
use crate::store::SharedStore;

/// Orchestrator state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the due time
    #[default]
    Idle,
    /// Due time reached or forced
    Due,
    /// Pipeline call in flight
    Attempting,
    /// Just published; display-only window
    Cooldown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Due => "due",
            Self::Attempting => "attempting",
            Self::Cooldown => "cooldown",
        }
    }
}

/// Last-known result of the orchestrator, for status queries
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub phase: Phase,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_source: Option<SourceId>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
}

/// Everything the scheduling components share
pub struct SchedulerContext {
    pub clock: SharedClock,
    pub store: SharedStore,
    pub settings: SchedulerConfig,
    pub schedule: RwLock<ScheduleManager>,
    pub rotation: RwLock<RotationManager>,
    pub blacklist: RwLock<Blacklist>,
    pub limiter: RateLimiter,
    pub breakers: BreakerRegistry,
    pub notifier: SharedNotifier,
    pub pipeline: SharedPipeline,
    pub run_status: RwLock<RunStatus>,
    // Held for the whole of an attempt; ticks that find it taken skip
    pub(crate) attempt_lock: Mutex<()>,
}

impl SchedulerContext {
    /// Load persisted state and build the resilience layer
    ///
    /// A store read failure here is fatal: the caller must not start the
    /// loops on top of defaults that would overwrite real state.
    pub fn load(
        config: &Config,
        store: SharedStore,
        clock: SharedClock,
        pipeline: SharedPipeline,
        notifier: SharedNotifier,
    ) -> crate::error::Result<Self> {
        let settings = &config.scheduler;
        if settings.tick_secs == 0 {
            return Err(SchedulerError::invalid_config("tick_secs", "must be greater than 0").into());
        }
        if settings.pipeline_timeout_secs == 0 {
            return Err(SchedulerError::invalid_config(
                "pipeline_timeout_secs",
                "must be greater than 0",
            )
            .into());
        }

        let startup_time = clock.now();
        let schedule = ScheduleManager::load(
            Arc::clone(&store),
            startup_time,
            config.scheduler.startup_grace_secs,
        )?;
        let mut rotation = RotationManager::load(Arc::clone(&store))?;
        let blacklist = Blacklist::load(Arc::clone(&store))?;

        for raw in &config.scheduler.seed_sources {
            let id = SourceId::parse(raw)?;
            if rotation.state().get(&id).is_none() {
                rotation.activate(id, startup_time)?;
            }
        }

        let limiter = RateLimiter::new(config.rate_limits.clone(), Arc::clone(&clock));
        let breakers = BreakerRegistry::new(
            config.breakers.clone(),
            Arc::clone(&clock),
            Some(Arc::clone(&store)),
        );

        Ok(Self {
            clock,
            store,
            settings: config.scheduler.clone(),
            schedule: RwLock::new(schedule),
            rotation: RwLock::new(rotation),
            blacklist: RwLock::new(blacklist),
            limiter,
            breakers,
            notifier,
            pipeline,
            run_status: RwLock::new(RunStatus::default()),
            attempt_lock: Mutex::new(()),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True when every persisted structure reached the store on its last write
    pub async fn persistence_healthy(&self) -> bool {
        let schedule = self.schedule.read().await.is_persisted();
        let rotation = self.rotation.read().await.is_persisted();
        let blacklist = self.blacklist.read().await.is_persisted();
        schedule && rotation && blacklist
    }

    /// Retry writes that failed earlier
    pub async fn flush_pending(&self) {
        if let Err(e) = self.schedule.write().await.flush() {
            tracing::warn!(error = %e, "Schedule state still not persisted");
        }
        if let Err(e) = self.rotation.write().await.flush() {
            tracing::warn!(error = %e, "Rotation state still not persisted");
        }
        if let Err(e) = self.blacklist.write().await.flush() {
            tracing::warn!(error = %e, "Blacklist still not persisted");
        }
    }

    pub(crate) async fn set_phase(&self, phase: Phase) {
        self.run_status.write().await.phase = phase;
    }
}
