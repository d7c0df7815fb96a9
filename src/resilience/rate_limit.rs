//! Token-bucket rate limiting per named dependency
//!
//! Buckets refill lazily: each acquisition computes the tokens accrued since
//! the last refill, so there is no background timer. A caller that finds the
//! bucket empty reserves the next token (pushing `last_refill` into the
//! future) and then sleeps outside the lock, so concurrent waiters queue
//! behind each other instead of claiming the same accrual twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::clock::SharedClock;

/// Name of the fallback bucket used for unknown dependencies
pub const DEFAULT_BUCKET: &str = "default";

/// Bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained refill rate
    pub calls_per_second: f64,

    /// Bucket capacity
    pub burst_limit: u32,
}

impl RateLimitConfig {
    pub fn new(calls_per_second: f64, burst_limit: u32) -> Self {
        Self {
            calls_per_second,
            burst_limit,
        }
    }

    /// Check the parameters can produce tokens
    pub fn validate(&self) -> Result<(), String> {
        if !(self.calls_per_second.is_finite() && self.calls_per_second > 0.0) {
            return Err(format!(
                "calls_per_second must be positive, got {}",
                self.calls_per_second
            ));
        }
        if self.burst_limit == 0 {
            return Err("burst_limit must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Built-in limits: messaging source, publish target and the fallback
pub fn default_limits() -> HashMap<String, RateLimitConfig> {
    HashMap::from([
        ("source".to_string(), RateLimitConfig::new(20.0, 30)),
        ("publisher".to_string(), RateLimitConfig::new(30.0, 50)),
        (DEFAULT_BUCKET.to_string(), RateLimitConfig::new(5.0, 10)),
    ])
}

/// Read-only counters for one bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimiterStats {
    /// Bucket the stats belong to (unknown names resolve to `default`)
    pub bucket: String,
    /// Admitted calls
    pub calls: u64,
    /// Admitted calls that had to wait
    pub waited_calls: u64,
    /// Cumulative wait in seconds
    pub total_wait_secs: f64,
    /// Calls refused by a bounded acquisition
    pub denied_calls: u64,
    /// Tokens available at the last refill
    pub tokens: f64,
}

/// Bounded acquisition gave up
#[derive(Debug, Clone, Error)]
#[error("rate limit for '{dependency}' needs {needed:?} wait, more than allowed {max_wait:?}")]
pub struct RateLimited {
    pub dependency: String,
    pub needed: Duration,
    pub max_wait: Duration,
}

#[derive(Debug)]
struct Bucket {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: DateTime<Utc>,
    stats: RateLimiterStats,
}

impl Bucket {
    fn new(name: &str, config: RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            tokens: f64::from(config.burst_limit),
            last_refill: now,
            stats: RateLimiterStats {
                bucket: name.to_string(),
                ..Default::default()
            },
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = secs_between(self.last_refill, now);
        self.tokens = (self.tokens + elapsed * self.config.calls_per_second)
            .min(f64::from(self.config.burst_limit));
        self.last_refill = now;
    }

    /// Seconds until one token is available for this caller
    fn wait_needed(&self, now: DateTime<Utc>) -> f64 {
        let queued_ahead = if self.last_refill > now {
            secs_between(now, self.last_refill)
        } else {
            0.0
        };
        queued_ahead + (1.0 - self.tokens).max(0.0) / self.config.calls_per_second
    }

    fn reserve(&mut self, now: DateTime<Utc>, wait_secs: f64) {
        self.tokens = 0.0;
        self.last_refill = now + chrono_secs(wait_secs);
        self.stats.calls += 1;
        self.stats.waited_calls += 1;
        self.stats.total_wait_secs += wait_secs;
    }
}

fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

fn chrono_secs(secs: f64) -> chrono::Duration {
    chrono::Duration::microseconds((secs * 1_000_000.0).ceil() as i64)
}

/// Per-dependency token buckets
pub struct RateLimiter {
    configs: HashMap<String, RateLimitConfig>,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter with explicit bucket configs
    ///
    /// A `default` bucket is added when the map lacks one.
    pub fn new(mut configs: HashMap<String, RateLimitConfig>, clock: SharedClock) -> Self {
        configs
            .entry(DEFAULT_BUCKET.to_string())
            .or_insert_with(|| RateLimitConfig::new(5.0, 10));
        Self {
            configs,
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Create a limiter with [`default_limits`]
    pub fn with_defaults(clock: SharedClock) -> Self {
        Self::new(default_limits(), clock)
    }

    fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        if self.configs.contains_key(name) {
            name
        } else {
            DEFAULT_BUCKET
        }
    }

    fn with_bucket<R>(&self, name: &str, f: impl FnOnce(&mut Bucket, DateTime<Utc>) -> R) -> R {
        let bucket_name = self.resolve(name);
        let config = self.configs[bucket_name];
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(bucket_name.to_string())
            .or_insert_with(|| Bucket::new(bucket_name, config, now));
        bucket.refill(now);
        f(bucket, now)
    }

    /// Take one token, waiting as long as needed; returns the time waited
    pub async fn acquire(&self, name: &str) -> Duration {
        let wait_secs = self.with_bucket(name, |bucket, now| {
            if bucket.last_refill <= now && bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                bucket.stats.calls += 1;
                return 0.0;
            }
            let wait = bucket.wait_needed(now);
            bucket.reserve(now, wait);
            wait
        });

        self.finish_wait(name, wait_secs).await
    }

    /// Take one token unless that would mean waiting longer than `max_wait`
    ///
    /// A refused call consumes nothing.
    pub async fn try_acquire_within(
        &self,
        name: &str,
        max_wait: Duration,
    ) -> Result<Duration, RateLimited> {
        let decision = self.with_bucket(name, |bucket, now| {
            if bucket.last_refill <= now && bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                bucket.stats.calls += 1;
                return Ok(0.0);
            }
            let wait = bucket.wait_needed(now);
            if wait > max_wait.as_secs_f64() {
                bucket.stats.denied_calls += 1;
                return Err(wait);
            }
            bucket.reserve(now, wait);
            Ok(wait)
        });

        match decision {
            Ok(wait_secs) => Ok(self.finish_wait(name, wait_secs).await),
            Err(needed) => {
                tracing::debug!(
                    dependency = name,
                    needed_secs = needed,
                    max_wait_secs = max_wait.as_secs_f64(),
                    "Rate limit admission refused"
                );
                Err(RateLimited {
                    dependency: name.to_string(),
                    needed: Duration::from_secs_f64(needed),
                    max_wait,
                })
            }
        }
    }

    async fn finish_wait(&self, name: &str, wait_secs: f64) -> Duration {
        if wait_secs <= 0.0 {
            return Duration::ZERO;
        }
        let wait = Duration::from_secs_f64(wait_secs);
        tracing::debug!(dependency = name, wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
        crate::metrics::record_rate_limit_wait(self.resolve(name), wait_secs);
        tokio::time::sleep(wait).await;
        wait
    }

    /// Counters for the bucket `name` resolves to
    pub fn stats(&self, name: &str) -> RateLimiterStats {
        self.with_bucket(name, |bucket, _| {
            let mut stats = bucket.stats.clone();
            stats.tokens = bucket.tokens;
            stats
        })
    }

    /// Configured bucket names
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Refill a bucket to capacity and clear its counters
    pub fn reset(&self, name: &str) {
        let bucket_name = self.resolve(name).to_string();
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&bucket_name);
    }
}
