//! Admission control for outbound calls
//!
//! - [`rate_limit`] - token buckets shaping demand per dependency
//! - [`breaker`] - circuit breakers isolating failing dependencies

pub mod breaker;
pub mod rate_limit;

pub use breaker::{
    default_breakers, BreakerConfig, BreakerPermit, BreakerRegistry, BreakerSnapshot,
    BreakerState, BreakerStats, CircuitBreaker, CircuitOpen, Guarded,
};
pub use rate_limit::{
    default_limits, RateLimitConfig, RateLimited, RateLimiter, RateLimiterStats, DEFAULT_BUCKET,
};
