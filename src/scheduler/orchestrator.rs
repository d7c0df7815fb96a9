//! Posting orchestrator
//!
//! Wakes on a fixed tick and decides whether a fetch-translate-publish cycle
//! is due. A due cycle takes the next source from the rotation, runs the
//! pipeline under the rate limiter and circuit breaker of each dependency,
//! and records the outcome.
//!
//! ```text
//!   IDLE ──due/forced──▶ DUE ──candidate──▶ ATTEMPTING ──published──▶ COOLDOWN
//!    ▲                    │                     │                        │
//!    └──── no candidate ──┘                     └──── any failure ───────┴──▶ IDLE
//! ```
//!
//! The rotation cursor advances once per attempt whatever the outcome, so a
//! source that always fails cannot starve the others. Only a publish moves
//! `last_success_time`; failures leave the cycle due and the next tick tries
//! the next source.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::context::{Phase, SchedulerContext};
use super::rotation::SourceId;
use super::schedule::DueDecision;
use crate::notifications::{Alert, AlertSeverity};
use crate::resilience::{BreakerState, Guarded};

/// Dependency name of the messaging source
pub const SOURCE_DEPENDENCY: &str = "source";

/// Dependency name of the publish target
pub const PUBLISHER_DEPENDENCY: &str = "publisher";

/// Result of one attempt against one source
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Something was published
    Published { content_id: String },
    /// The source had nothing fresh, or the publisher declined
    NothingNew { reason: String },
    /// Admission would have needed too long a rate-limit wait
    RateLimited { dependency: String, needed: Duration },
    /// The dependency's circuit is open
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },
    /// A dependency call failed
    Failed { dependency: String, error: String },
    /// The attempt ran past the pipeline timeout
    TimedOut { after: Duration },
}

impl AttemptOutcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::NothingNew { .. } => "nothing_new",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Published { .. })
    }

    /// Human-readable error, `None` for success
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Published { .. } => None,
            Self::NothingNew { reason } => Some(reason.clone()),
            Self::RateLimited { dependency, needed } => Some(format!(
                "rate limit on '{dependency}' needs {:.1}s wait",
                needed.as_secs_f64()
            )),
            Self::CircuitOpen {
                dependency,
                retry_after,
            } => Some(format!(
                "circuit '{dependency}' open, retry in {}s",
                retry_after.as_secs()
            )),
            Self::Failed { dependency, error } => Some(format!("{dependency}: {error}")),
            Self::TimedOut { after } => Some(format!("timed out after {}s", after.as_secs())),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another attempt still holds the in-flight slot
    Busy,
    /// Not due; carries the reason
    NotDue(DueDecision),
    /// Due, but no active source
    NoCandidate,
    /// An attempt ran
    Attempted {
        source: SourceId,
        forced: bool,
        outcome: AttemptOutcome,
    },
}

/// Drives posting cycles off a [`SchedulerContext`]
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<SchedulerContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.ctx.settings.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_secs = self.ctx.settings.tick_secs,
            grace_secs = self.ctx.settings.startup_grace_secs,
            "Orchestrator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    /// One due check, and an attempt if due
    ///
    /// Never fails: every error is logged and folded into the outcome.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_in_flight) = self.ctx.attempt_lock.try_lock() else {
            tracing::debug!("Attempt still in flight, skipping tick");
            return TickOutcome::Busy;
        };

        self.ctx.flush_pending().await;
        let now = self.ctx.now();
        self.leave_cooldown(now).await;

        let decision = {
            let mut schedule = self.ctx.schedule.write().await;
            let decision = schedule.evaluate(now);
            if let DueDecision::Due { forced: true } = decision {
                // Cleared in the same step that acts on it
                if let Err(e) = schedule.consume_force() {
                    tracing::error!(error = %e, "Force flag consumed but not persisted");
                }
            }
            decision
        };

        let forced = match decision {
            DueDecision::Due { forced } => forced,
            other => {
                tracing::trace!(decision = ?other, "Cycle not due");
                return TickOutcome::NotDue(other);
            }
        };
        self.ctx.set_phase(Phase::Due).await;

        let candidate = self.ctx.rotation.write().await.next_candidate();
        let Some(source) = candidate else {
            tracing::info!("Cycle due but no active sources");
            self.ctx.set_phase(Phase::Idle).await;
            return TickOutcome::NoCandidate;
        };

        tracing::info!(source = %source, forced, "Starting posting attempt");
        self.ctx.set_phase(Phase::Attempting).await;

        let breakers_before = self.breaker_states();
        let started = Instant::now();
        let timeout = self.ctx.settings.pipeline_timeout();
        let outcome = match tokio::time::timeout(timeout, self.attempt(&source)).await {
            Ok(outcome) => outcome,
            // The attempt future is dropped here; any breaker permit it held
            // records a failure on drop.
            Err(_) => AttemptOutcome::TimedOut { after: timeout },
        };

        self.record(&source, &outcome, started.elapsed()).await;
        self.alert_opened_breakers(&breakers_before).await;

        TickOutcome::Attempted {
            source,
            forced,
            outcome,
        }
    }

    async fn leave_cooldown(&self, now: chrono::DateTime<chrono::Utc>) {
        let window = chrono::Duration::seconds(self.ctx.settings.just_posted_window_secs as i64);
        let last = self.ctx.schedule.read().await.state().last_success_time;
        let mut status = self.ctx.run_status.write().await;
        if status.phase == Phase::Cooldown && last.map_or(true, |t| now >= t + window) {
            status.phase = Phase::Idle;
        }
    }

    async fn attempt(&self, source: &SourceId) -> AttemptOutcome {
        let max_wait = self.ctx.settings.max_admission_wait();

        if let Err(limited) = self
            .ctx
            .limiter
            .try_acquire_within(SOURCE_DEPENDENCY, max_wait)
            .await
        {
            return AttemptOutcome::RateLimited {
                dependency: limited.dependency,
                needed: limited.needed,
            };
        }

        let fetch = self
            .guarded(
                SOURCE_DEPENDENCY,
                self.ctx.pipeline.fetch_candidate_content(source),
            )
            .await;
        let batch = match fetch {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                return AttemptOutcome::NothingNew {
                    reason: format!("no content from {source}"),
                }
            }
            Err(outcome) => return outcome,
        };

        let fresh = {
            let blacklist = self.ctx.blacklist.read().await;
            batch
                .items
                .into_iter()
                .find(|item| !blacklist.is_blacklisted(&item.id))
        };
        let Some(item) = fresh else {
            return AttemptOutcome::NothingNew {
                reason: format!("everything from {source} already published"),
            };
        };

        if let Err(limited) = self
            .ctx
            .limiter
            .try_acquire_within(PUBLISHER_DEPENDENCY, max_wait)
            .await
        {
            return AttemptOutcome::RateLimited {
                dependency: limited.dependency,
                needed: limited.needed,
            };
        }

        let publish = self
            .guarded(
                PUBLISHER_DEPENDENCY,
                self.ctx.pipeline.translate_and_publish(source, &item),
            )
            .await;
        match publish {
            Ok(true) => AttemptOutcome::Published {
                content_id: item.id,
            },
            Ok(false) => AttemptOutcome::NothingNew {
                reason: format!("publisher declined item {}", item.id),
            },
            Err(outcome) => outcome,
        }
    }

    /// Run `work` under the breaker of `dependency`
    async fn guarded<T, F>(&self, dependency: &str, work: F) -> Result<T, AttemptOutcome>
    where
        F: std::future::Future<Output = Result<T, crate::pipeline::PipelineError>>,
    {
        match self.ctx.breakers.get(dependency).call(work).await {
            Guarded::Ok(value) => Ok(value),
            Guarded::CircuitOpen(open) => Err(AttemptOutcome::CircuitOpen {
                dependency: dependency.to_string(),
                retry_after: open.retry_after,
            }),
            Guarded::Failure(e) => {
                tracing::warn!(
                    dependency,
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "Dependency call failed"
                );
                Err(AttemptOutcome::Failed {
                    dependency: dependency.to_string(),
                    error: e.to_string(),
                })
            }
        }
    }

    fn breaker_states(&self) -> [(&'static str, BreakerState); 2] {
        [SOURCE_DEPENDENCY, PUBLISHER_DEPENDENCY]
            .map(|dependency| (dependency, self.ctx.breakers.get(dependency).state()))
    }

    /// Alert for every breaker the attempt tripped
    ///
    /// A timed-out attempt records its breaker failure only when dropped, so
    /// this runs after the attempt has finished either way.
    async fn alert_opened_breakers(&self, before: &[(&'static str, BreakerState)]) {
        for &(dependency, was) in before {
            let breaker = self.ctx.breakers.get(dependency);
            if was == BreakerState::Open || breaker.state() != BreakerState::Open {
                continue;
            }
            let stats = breaker.stats();
            self.ctx
                .notifier
                .deliver(
                    Alert::new(
                        AlertSeverity::Critical,
                        format!(
                            "Circuit for '{dependency}' opened after {} consecutive failures: {}",
                            stats.failure_count,
                            stats.last_error.as_deref().unwrap_or("unknown error")
                        ),
                    )
                    .with_source("orchestrator")
                    .with_condition(format!("breaker:{dependency}")),
                )
                .await;
        }
    }

    /// Apply an attempt's outcome to the persisted state
    ///
    /// Writes go schedule, then rotation, then blacklist. A crash between two
    /// of them costs at most one skipped or repeated source.
    async fn record(&self, source: &SourceId, outcome: &AttemptOutcome, elapsed: Duration) {
        let now = self.ctx.now();

        if let AttemptOutcome::Published { content_id } = outcome {
            if let Err(e) = self.ctx.schedule.write().await.record_success(now) {
                tracing::error!(error = %e, "Success recorded in memory only");
            }
            if let Err(e) = self.ctx.rotation.write().await.advance(source) {
                tracing::error!(source = %source, error = %e, "Rotation advanced in memory only");
            }
            if let Err(e) = self.ctx.blacklist.write().await.add(content_id.clone()) {
                tracing::error!(content_id = %content_id, error = %e, "Blacklist entry not persisted");
            }
            tracing::info!(
                source = %source,
                content_id = %content_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Published"
            );
        } else {
            if let Err(e) = self.ctx.rotation.write().await.advance(source) {
                tracing::error!(source = %source, error = %e, "Rotation advanced in memory only");
            }
            tracing::warn!(
                source = %source,
                outcome = outcome.label(),
                reason = outcome.error_message().as_deref().unwrap_or(""),
                "Posting attempt failed"
            );
        }

        {
            let mut status = self.ctx.run_status.write().await;
            status.phase = if outcome.is_success() {
                Phase::Cooldown
            } else {
                Phase::Idle
            };
            status.last_attempt_at = Some(now);
            status.last_source = Some(source.clone());
            status.last_outcome = Some(outcome.label().to_string());
            status.last_error = outcome.error_message();
        }

        crate::metrics::record_attempt(outcome.label(), elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::Config;
    use crate::notifications::RecordingNotifier;
    use crate::pipeline::{ContentBatch, ContentItem, Pipeline, PipelineError};
    use crate::clock::Clock;
    use crate::resilience::{BreakerConfig, RateLimitConfig};
    use crate::store::{MemoryStore, SharedStore};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedPipeline {
        fetch_fails: Mutex<HashMap<String, bool>>,
        hangs: Mutex<bool>,
        fetch_started: tokio::sync::Notify,
        items: Mutex<HashMap<String, Vec<String>>>,
        fetched: Mutex<Vec<String>>,
        published: Mutex<Vec<String>>,
    }

    impl ScriptedPipeline {
        fn fail(&self, source: &str) {
            self.fetch_fails.lock().unwrap().insert(source.into(), true);
        }

        /// Make every fetch block for an hour
        fn hang(&self) {
            *self.hangs.lock().unwrap() = true;
        }

        fn offer(&self, source: &str, ids: &[&str]) {
            self.items
                .lock()
                .unwrap()
                .insert(source.into(), ids.iter().map(|s| s.to_string()).collect());
        }
    }

    #[async_trait]
    impl Pipeline for ScriptedPipeline {
        async fn fetch_candidate_content(
            &self,
            source: &SourceId,
        ) -> Result<Option<ContentBatch>, PipelineError> {
            self.fetched.lock().unwrap().push(source.to_string());
            self.fetch_started.notify_one();
            let hangs = *self.hangs.lock().unwrap();
            if hangs {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fetch_fails.lock().unwrap().get(source.as_str()).copied().unwrap_or(false) {
                return Err(PipelineError::Transport("connection reset".into()));
            }
            let ids = self.items.lock().unwrap().get(source.as_str()).cloned();
            Ok(ids.map(|ids| ContentBatch {
                source: source.to_string(),
                items: ids
                    .into_iter()
                    .map(|id| ContentItem {
                        id,
                        text: "text".into(),
                        media_urls: vec![],
                        posted_at: None,
                    })
                    .collect(),
            }))
        }

        async fn translate_and_publish(
            &self,
            _source: &SourceId,
            item: &ContentItem,
        ) -> Result<bool, PipelineError> {
            self.published.lock().unwrap().push(item.id.clone());
            Ok(true)
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        clock: ManualClock,
        pipeline: Arc<ScriptedPipeline>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(sources: &[&str], grace: u64, interval: u64) -> Harness {
        harness_with(sources, grace, interval, |_| {})
    }

    fn harness_with(
        sources: &[&str],
        grace: u64,
        interval: u64,
        tweak: impl FnOnce(&mut Config),
    ) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(ScriptedPipeline::default());
        let notifier = Arc::new(RecordingNotifier::new());

        let mut config = Config::default();
        config.scheduler.startup_grace_secs = grace;
        config.scheduler.seed_sources = sources.iter().map(|s| s.to_string()).collect();
        config
            .breakers
            .insert(SOURCE_DEPENDENCY.into(), BreakerConfig::new(2, 300));
        tweak(&mut config);

        let ctx = SchedulerContext::load(&config, store, shared_clock, pipeline.clone(), notifier.clone())
            .unwrap();
        ctx.schedule.try_write().unwrap().set_interval(interval).unwrap();

        Harness {
            orchestrator: Orchestrator::new(Arc::new(ctx)),
            clock,
            pipeline,
            notifier,
        }
    }

    fn attempted(outcome: &TickOutcome) -> (&str, &AttemptOutcome) {
        match outcome {
            TickOutcome::Attempted { source, outcome, .. } => (source.as_str(), outcome),
            other => panic!("expected an attempt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_grace_blocks_force() {
        let h = harness(&["a"], 120, 3600);
        h.orchestrator.context().schedule.write().await.request_force().unwrap();

        assert!(matches!(
            h.orchestrator.tick().await,
            TickOutcome::NotDue(DueDecision::InGrace { .. })
        ));
        // Pending force survives the grace period
        assert!(h.orchestrator.context().schedule.read().await.state().force_flag);

        h.clock.advance_secs(120);
        h.pipeline.offer("a", &["m1"]);
        let outcome = h.orchestrator.tick().await;
        assert!(matches!(outcome, TickOutcome::Attempted { forced: true, .. }));
        assert!(!h.orchestrator.context().schedule.read().await.state().force_flag);
    }

    #[tokio::test]
    async fn test_disabled_interval_never_attempts() {
        let h = harness(&["a"], 0, 0);
        assert_eq!(h.orchestrator.tick().await, TickOutcome::NotDue(DueDecision::Disabled));
        assert!(h.pipeline.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_advances_without_success() {
        let h = harness(&["a", "b", "c"], 0, 3600);
        h.pipeline.fail("a");

        let outcome = h.orchestrator.tick().await;
        let (source, result) = attempted(&outcome);
        assert_eq!(source, "a");
        assert!(matches!(result, AttemptOutcome::Failed { .. }));

        let ctx = h.orchestrator.context();
        assert_eq!(ctx.rotation.read().await.state().cursor, 1);
        assert!(ctx.schedule.read().await.state().last_success_time.is_none());
        let status = ctx.run_status.read().await;
        assert_eq!(status.last_outcome.as_deref(), Some("failed"));
        assert_eq!(status.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_success_records_and_blacklists() {
        let h = harness(&["a", "b"], 0, 3600);
        h.pipeline.offer("a", &["m1", "m2"]);

        let outcome = h.orchestrator.tick().await;
        assert_eq!(
            attempted(&outcome).1,
            &AttemptOutcome::Published {
                content_id: "m1".into()
            }
        );

        let ctx = h.orchestrator.context();
        assert_eq!(ctx.schedule.read().await.state().last_success_time, Some(ctx.now()));
        assert!(ctx.blacklist.read().await.is_blacklisted("m1"));
        assert_eq!(ctx.run_status.read().await.phase, Phase::Cooldown);

        // Not due again until the interval passes
        h.clock.advance_secs(60);
        assert!(matches!(h.orchestrator.tick().await, TickOutcome::NotDue(_)));
        assert_eq!(ctx.run_status.read().await.phase, Phase::Idle);

        // Next round on `a` skips the published item
        h.clock.advance_secs(3600);
        h.pipeline.offer("b", &[]);
        h.orchestrator.tick().await;
        h.orchestrator.tick().await;
        assert_eq!(*h.pipeline.published.lock().unwrap(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_everything_blacklisted_is_nothing_new() {
        let h = harness(&["a"], 0, 3600);
        h.orchestrator.context().blacklist.write().await.add("old").unwrap();
        h.pipeline.offer("a", &["old"]);

        let outcome = h.orchestrator.tick().await;
        assert!(matches!(attempted(&outcome).1, AttemptOutcome::NothingNew { .. }));
        let breaker = h.orchestrator.context().breakers.get(SOURCE_DEPENDENCY);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn test_no_active_sources() {
        let h = harness(&[], 0, 3600);
        assert_eq!(h.orchestrator.tick().await, TickOutcome::NoCandidate);
    }

    #[tokio::test]
    async fn test_open_breaker_is_not_a_new_failure() {
        let h = harness(&["a"], 0, 3600);
        h.pipeline.fail("a");

        h.orchestrator.tick().await;
        h.orchestrator.tick().await;
        let breaker = h.orchestrator.context().breakers.get(SOURCE_DEPENDENCY);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(h.notifier.alerts().len(), 1);

        let outcome = h.orchestrator.tick().await;
        assert!(matches!(attempted(&outcome).1, AttemptOutcome::CircuitOpen { .. }));
        assert_eq!(breaker.stats().failure_count, 2);
        assert_eq!(h.pipeline.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_busy_while_attempt_in_flight() {
        let h = harness(&["a"], 0, 3600);
        let _held = h.orchestrator.context().attempt_lock.try_lock().unwrap();
        assert_eq!(h.orchestrator.tick().await, TickOutcome::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let h = harness_with(&["a", "b"], 0, 3600, |config| {
            config.scheduler.pipeline_timeout_secs = 5;
            config
                .breakers
                .insert(SOURCE_DEPENDENCY.into(), BreakerConfig::new(1, 300));
        });
        h.pipeline.hang();

        let outcome = h.orchestrator.tick().await;
        let (source, result) = attempted(&outcome);
        assert_eq!(source, "a");
        assert_eq!(
            result,
            &AttemptOutcome::TimedOut {
                after: Duration::from_secs(5)
            }
        );

        let ctx = h.orchestrator.context();
        assert_eq!(ctx.rotation.read().await.state().cursor, 1);
        assert!(ctx.schedule.read().await.state().last_success_time.is_none());
        assert_eq!(ctx.run_status.read().await.last_outcome.as_deref(), Some("timed_out"));

        let breaker = ctx.breakers.get(SOURCE_DEPENDENCY);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.stats().failure_count, 1);

        // The breaker opened while the attempt was being dropped
        let alerts = h.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].condition.as_deref(), Some("breaker:source"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_during_attempt_is_busy_and_force_waits() {
        let h = harness_with(&["a", "b"], 0, 3600, |config| {
            config.scheduler.pipeline_timeout_secs = 5;
        });
        let ctx = h.orchestrator.context();
        ctx.schedule
            .write()
            .await
            .record_success(h.clock.now() - chrono::Duration::seconds(60))
            .unwrap();
        ctx.schedule.write().await.request_force().unwrap();
        h.pipeline.hang();

        let first = h.orchestrator.tick();
        tokio::pin!(first);
        tokio::select! {
            outcome = &mut first => panic!("attempt should still be running, got {outcome:?}"),
            _ = h.pipeline.fetch_started.notified() => {}
        }

        // A second tick and a new force arrive while `a` is in flight
        assert_eq!(h.orchestrator.tick().await, TickOutcome::Busy);
        ctx.schedule.write().await.request_force().unwrap();

        let outcome = first.await;
        assert!(matches!(
            outcome,
            TickOutcome::Attempted {
                forced: true,
                outcome: AttemptOutcome::TimedOut { .. },
                ..
            }
        ));
        assert!(ctx.schedule.read().await.state().force_flag);
        assert_eq!(*h.pipeline.fetched.lock().unwrap(), vec!["a"]);

        // The deferred force drives the next tick
        match h.orchestrator.tick().await {
            TickOutcome::Attempted { source, forced, .. } => {
                assert_eq!(source.as_str(), "b");
                assert!(forced);
            }
            other => panic!("expected the deferred forced attempt, got {other:?}"),
        }
        assert!(!ctx.schedule.read().await.state().force_flag);
    }

    #[tokio::test]
    async fn test_rate_limited_admission_advances_without_breaker() {
        let h = harness_with(&["a", "b", "c"], 0, 3600, |config| {
            config.scheduler.max_admission_wait_secs = 10;
            config
                .rate_limits
                .insert(SOURCE_DEPENDENCY.into(), RateLimitConfig::new(0.0625, 1));
        });

        // `a` has nothing new and uses up the only token
        let outcome = h.orchestrator.tick().await;
        assert!(matches!(attempted(&outcome).1, AttemptOutcome::NothingNew { .. }));

        let outcome = h.orchestrator.tick().await;
        let (source, result) = attempted(&outcome);
        assert_eq!(source, "b");
        match result {
            AttemptOutcome::RateLimited { dependency, needed } => {
                assert_eq!(dependency, SOURCE_DEPENDENCY);
                assert_eq!(*needed, Duration::from_secs(16));
            }
            other => panic!("expected a rate-limit denial, got {other:?}"),
        }

        let ctx = h.orchestrator.context();
        assert_eq!(ctx.rotation.read().await.state().cursor, 2);
        assert_eq!(*h.pipeline.fetched.lock().unwrap(), vec!["a"]);

        let stats = ctx.breakers.get(SOURCE_DEPENDENCY).stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.rejected_calls, 0);
        assert!(h.notifier.alerts().is_empty());
    }
}
