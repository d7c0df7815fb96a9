//! Prometheus metrics for the relay
//!
//! Tracks:
//! - Posting attempts by outcome and their duration
//! - Rate-limit waits per dependency
//! - Circuit breaker state per dependency
//! - Host CPU / memory as seen by the health monitor
//! - Admin API requests
//!
//! Call [`init_metrics`] once at startup. Before that, and if registration
//! fails, every recording function is a no-op.

use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::resilience::BreakerState;

// ============================================================================
// Metrics Storage
// ============================================================================

struct RelayMetrics {
    attempts: CounterVec,
    attempt_duration: Histogram,
    rate_limit_wait: CounterVec,
    breaker_state: GaugeVec,
    health_cpu: Gauge,
    health_memory: Gauge,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

static METRICS: OnceLock<RelayMetrics> = OnceLock::new();

static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Register all metrics with the default registry
///
/// Idempotent. On failure the error is returned and recording stays a no-op;
/// the relay keeps running without metrics.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = RelayMetrics {
        attempts: register_counter_vec!(
            "newsrelay_attempts_total",
            "Posting attempts by outcome",
            &["outcome"]
        )?,
        attempt_duration: register_histogram!(
            "newsrelay_attempt_duration_seconds",
            "Wall time of a posting attempt in seconds",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )?,
        rate_limit_wait: register_counter_vec!(
            "newsrelay_rate_limit_wait_seconds_total",
            "Cumulative time spent waiting for rate-limit tokens",
            &["dependency"]
        )?,
        breaker_state: register_gauge_vec!(
            "newsrelay_breaker_state",
            "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)",
            &["dependency"]
        )?,
        health_cpu: register_gauge!(
            "newsrelay_health_cpu_percent",
            "Host CPU usage percent at the last health sample"
        )?,
        health_memory: register_gauge!(
            "newsrelay_health_memory_percent",
            "Host memory usage percent at the last health sample"
        )?,
        api_requests: register_counter_vec!(
            "newsrelay_api_requests_total",
            "Admin API requests by route and status",
            &["route", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "newsrelay_api_request_duration_seconds",
            "Admin API request duration in seconds",
            &["route"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
        )?,
    };

    METRICS
        .set(metrics)
        .map_err(|_| "Relay metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

pub fn metrics_initialized() -> bool {
    METRICS.get().is_some()
}

/// Encode the default registry in Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Recording
// ============================================================================

/// Count one finished attempt
pub fn record_attempt(outcome: &str, duration_secs: f64) {
    let Some(m) = METRICS.get() else {
        return;
    };
    m.attempts.with_label_values(&[outcome]).inc();
    m.attempt_duration.observe(duration_secs);
}

pub fn record_rate_limit_wait(dependency: &str, wait_secs: f64) {
    if wait_secs <= 0.0 {
        return;
    }
    if let Some(m) = METRICS.get() {
        m.rate_limit_wait
            .with_label_values(&[dependency])
            .inc_by(wait_secs);
    }
}

pub fn set_breaker_state(dependency: &str, state: BreakerState) {
    if let Some(m) = METRICS.get() {
        m.breaker_state
            .with_label_values(&[dependency])
            .set(state.gauge_value());
    }
}

pub fn set_health(cpu_percent: f64, memory_percent: f64) {
    if let Some(m) = METRICS.get() {
        m.health_cpu.set(cpu_percent);
        m.health_memory.set(memory_percent);
    }
}

pub fn record_api_request(route: &str, status: u16, duration_secs: f64) {
    let Some(m) = METRICS.get() else {
        return;
    };
    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[route, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[route])
        .observe(duration_secs);
}
