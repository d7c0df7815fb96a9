//! Circuit breaker per named dependency
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │ reset_timeout elapsed
//!     │ trial succeeds                 ▼
//!     └────────────────────────── HALF_OPEN ──▶ OPEN (trial fails)
//! ```
//!
//! Admission hands out a [`BreakerPermit`]. The permit must be settled with
//! [`BreakerPermit::success`] or [`BreakerPermit::failure`]; dropping it
//! unsettled (the guarded future was cancelled by a timeout, or panicked)
//! records a failure. Refused admission never counts as a failure.
//!
//! State is persisted under `breaker.<name>` after every change so an open
//! breaker stays open across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::store::{keys, SharedStore, StateStoreExt};

// ============================================================================
// Configuration
// ============================================================================

/// Breaker parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before a trial is allowed
    pub reset_timeout_secs: u64,

    /// Seconds a half-open trial may run before it is considered lost
    pub half_open_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 300,
            half_open_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_secs,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".into());
        }
        if self.half_open_timeout_secs == 0 {
            return Err("half_open_timeout_secs must be at least 1".into());
        }
        Ok(())
    }

    fn reset_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reset_timeout_secs as i64)
    }

    fn half_open_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.half_open_timeout_secs as i64)
    }
}

/// Built-in breakers for the messaging source and the publish target
pub fn default_breakers() -> HashMap<String, BreakerConfig> {
    HashMap::from([
        ("source".to_string(), BreakerConfig::new(3, 300)),
        ("publisher".to_string(), BreakerConfig::new(5, 300)),
    ])
}

// ============================================================================
// State
// ============================================================================

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted part of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Observable breaker counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub last_error: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,
}

/// Admission refused because the circuit is open
#[derive(Debug, Clone, Error)]
#[error("circuit '{name}' is open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub name: String,
    pub retry_after: Duration,
}

/// Outcome of a call guarded by a breaker
#[derive(Debug)]
pub enum Guarded<T, E> {
    /// The work ran and succeeded
    Ok(T),
    /// The work was never attempted
    CircuitOpen(CircuitOpen),
    /// The work ran and failed
    Failure(E),
}

impl<T, E> Guarded<T, E> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_state_change: Option<DateTime<Utc>>,
    // Id and start time of the half-open trial in flight
    trial: Option<(u64, DateTime<Utc>)>,
    next_trial_id: u64,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    last_error: Option<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_state_change: None,
            trial: None,
            next_trial_id: 1,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            last_error: None,
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Failure-isolation state machine for one dependency
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    clock: SharedClock,
    store: Option<SharedStore>,
}

impl CircuitBreaker {
    /// Create a closed breaker without persistence
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
            clock,
            store: None,
        }
    }

    /// Attach a store, restoring any persisted snapshot
    ///
    /// A persisted half-open state comes back as open: the trial did not
    /// survive the restart.
    pub fn with_store(mut self, store: SharedStore) -> Self {
        match store.load::<BreakerSnapshot>(&keys::breaker(&self.name)) {
            Ok(Some(snapshot)) => {
                let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
                inner.state = match snapshot.state {
                    BreakerState::HalfOpen => BreakerState::Open,
                    other => other,
                };
                inner.consecutive_failures = snapshot.consecutive_failures;
                inner.opened_at = match inner.state {
                    BreakerState::Open => snapshot.opened_at.or_else(|| Some(self.clock.now())),
                    _ => snapshot.opened_at,
                };
                tracing::info!(
                    breaker = %self.name,
                    state = %inner.state,
                    failures = inner.consecutive_failures,
                    "Restored circuit breaker state"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(breaker = %self.name, error = %e, "Ignoring unreadable breaker state");
            }
        }
        self.store = Some(store);
        crate::metrics::set_breaker_state(&self.name, self.state());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, without triggering the open → half-open transition
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: DateTime<Utc>) {
        if inner.state == to {
            return;
        }
        tracing::info!(breaker = %self.name, from = %inner.state, to = %to, "Circuit breaker transition");
        inner.state = to;
        inner.last_state_change = Some(now);
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(now);
                inner.trial = None;
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.trial = None;
            }
            BreakerState::HalfOpen => {}
        }
        crate::metrics::set_breaker_state(&self.name, to);
    }

    fn persist(&self, inner: &Inner) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&keys::breaker(&self.name), &inner.snapshot()) {
                tracing::error!(breaker = %self.name, error = %e, "Failed to persist circuit breaker state");
            }
        }
    }

    fn reject(&self, inner: &mut Inner, retry_after: chrono::Duration) -> CircuitOpen {
        inner.rejected_calls += 1;
        CircuitOpen {
            name: self.name.clone(),
            retry_after: retry_after.to_std().unwrap_or_default(),
        }
    }

    /// Ask for admission
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, CircuitOpen> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let trial_in_flight = inner.trial;
        let trial = match inner.state {
            BreakerState::Closed => None,
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now - opened_at;
                if elapsed < self.config.reset_timeout() {
                    let retry_after = self.config.reset_timeout() - elapsed;
                    return Err(self.reject(&mut inner, retry_after));
                }
                self.transition(&mut inner, BreakerState::HalfOpen, now);
                Some(self.start_trial(&mut inner, now))
            }
            BreakerState::HalfOpen => match trial_in_flight {
                Some((_, started)) if now - started < self.config.half_open_timeout() => {
                    let retry_after = self.config.half_open_timeout() - (now - started);
                    return Err(self.reject(&mut inner, retry_after));
                }
                Some(_) => {
                    tracing::warn!(breaker = %self.name, "Half-open trial timed out, reopening circuit");
                    inner.failed_calls += 1;
                    inner.consecutive_failures += 1;
                    inner.last_error = Some("half-open trial timed out".to_string());
                    self.transition(&mut inner, BreakerState::Open, now);
                    self.persist(&inner);
                    return Err(self.reject(&mut inner, self.config.reset_timeout()));
                }
                None => Some(self.start_trial(&mut inner, now)),
            },
        };

        inner.total_calls += 1;
        drop(inner);

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn start_trial(&self, inner: &mut Inner, now: DateTime<Utc>) -> u64 {
        let id = inner.next_trial_id;
        inner.next_trial_id += 1;
        inner.trial = Some((id, now));
        self.persist(inner);
        id
    }

    fn on_success(&self, trial: Option<u64>) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.successful_calls += 1;
        inner.consecutive_failures = 0;

        let current_trial = matches!((trial, inner.trial), (Some(a), Some((b, _))) if a == b);
        if inner.state == BreakerState::HalfOpen && current_trial {
            self.transition(&mut inner, BreakerState::Closed, now);
        }
        self.persist(&inner);
    }

    fn on_failure(&self, trial: Option<u64>, reason: String) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.failed_calls += 1;
        inner.consecutive_failures += 1;
        tracing::debug!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            threshold = self.config.failure_threshold,
            error = %reason,
            "Circuit breaker recorded failure"
        );
        inner.last_error = Some(reason);

        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    "Failure threshold reached, opening circuit"
                );
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::HalfOpen => {
                let current_trial = matches!((trial, inner.trial), (Some(a), Some((b, _))) if a == b);
                if current_trial {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            _ => {}
        }
        self.persist(&inner);
    }

    /// Run `work` under the breaker
    pub async fn call<T, E, F>(self: &Arc<Self>, work: F) -> Guarded<T, E>
    where
        E: fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(open) => return Guarded::CircuitOpen(open),
        };

        match work.await {
            Ok(value) => {
                permit.success();
                Guarded::Ok(value)
            }
            Err(e) => {
                permit.failure(&e);
                Guarded::Failure(e)
            }
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            last_error: inner.last_error.clone(),
            opened_at: inner.opened_at,
            last_state_change: inner.last_state_change,
        }
    }

    /// Force the breaker closed and clear its failure count
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.transition(&mut inner, BreakerState::Closed, now);
        inner.consecutive_failures = 0;
        inner.last_error = None;
        self.persist(&inner);
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }
}

/// Admission token; settles the call on every exit path
#[must_use = "an unsettled permit records a failure when dropped"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: Option<u64>,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self, reason: impl fmt::Display) {
        self.settled = true;
        self.breaker.on_failure(self.trial, reason.to_string());
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            let reason = if std::thread::panicking() {
                "guarded work panicked"
            } else {
                "guarded work cancelled before completion"
            };
            self.breaker.on_failure(self.trial, reason.to_string());
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Breakers by dependency name
pub struct BreakerRegistry {
    configs: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: SharedClock,
    store: Option<SharedStore>,
}

impl BreakerRegistry {
    /// Create breakers for every configured dependency
    pub fn new(
        configs: HashMap<String, BreakerConfig>,
        clock: SharedClock,
        store: Option<SharedStore>,
    ) -> Self {
        let registry = Self {
            configs,
            breakers: RwLock::new(HashMap::new()),
            clock,
            store,
        };
        let names: Vec<String> = registry.configs.keys().cloned().collect();
        for name in names {
            registry.get(&name);
        }
        registry
    }

    fn build(&self, name: &str) -> CircuitBreaker {
        let config = self.configs.get(name).copied().unwrap_or_default();
        let breaker = CircuitBreaker::new(name, config, Arc::clone(&self.clock));
        match &self.store {
            Some(store) => breaker.with_store(Arc::clone(store)),
            None => breaker,
        }
    }

    /// Breaker for `name`, created with default settings if unconfigured
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(self.build(name))),
        )
    }

    /// Stats of an existing breaker
    pub fn stats(&self, name: &str) -> Option<BreakerStats> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|b| b.stats())
    }

    /// Stats of every breaker, sorted by name
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset an existing breaker; false if unknown
    pub fn reset(&self, name: &str) -> bool {
        match self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
