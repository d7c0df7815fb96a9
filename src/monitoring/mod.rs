//! Host resource monitoring

pub mod health;

pub use health::{
    HealthMonitor, HealthReport, Level, ProcSampler, ResourceSample, ResourceSampler, SampleError,
};
