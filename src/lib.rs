//! newsrelay - scheduled news relay core
//!
//! Decides when to publish, which source to draw from, and whether its
//! dependencies are healthy enough to try. Fetching, translating and posting
//! are delegated to an external pipeline behind the [`pipeline::Pipeline`]
//! trait.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration from TOML or environment
//! - [`clock`] - Injectable wall clock
//! - [`store`] - Persistent key-value state (JSON file, SQLite, memory)
//! - [`resilience`] - Token-bucket rate limiting and circuit breakers
//! - [`scheduler`] - Schedule, rotation, orchestrator, presence, supervisor, admin
//! - [`monitoring`] - Host resource health checks
//! - [`notifications`] - Alert delivery (log, webhook)
//! - [`pipeline`] - Adapter to the fetch/translate/publish service
//! - [`api`] - Admin HTTP API
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use newsrelay::prelude::*;
//! use newsrelay::notifications::LogNotifier;
//! use newsrelay::pipeline::HttpPipeline;
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = newsrelay::store::open_store(config.storage.backend, &config.storage.path)?;
//!     let endpoints = config
//!         .pipeline
//!         .clone()
//!         .ok_or_else(|| anyhow::anyhow!("no pipeline endpoints configured"))?;
//!     let pipeline = Arc::new(HttpPipeline::new(endpoints)?);
//!     let ctx = SchedulerContext::load(
//!         &config,
//!         store,
//!         newsrelay::clock::system_clock(),
//!         pipeline,
//!         Arc::new(LogNotifier),
//!     )?;
//!     let outcome = Orchestrator::new(Arc::new(ctx)).tick().await;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitoring;
pub mod notifications;
pub mod pipeline;
pub mod resilience;
pub mod scheduler;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, RelayErrorTrait, Result};
    pub use crate::pipeline::{ContentBatch, ContentItem, Pipeline};
    pub use crate::scheduler::{
        Admin, AttemptOutcome, Orchestrator, Presence, SchedulerContext, SourceId, TickOutcome,
    };
    pub use crate::store::{SharedStore, StateStore};
}
