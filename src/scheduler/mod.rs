//! Posting scheduler
//!
//! Decides when the next publish attempt is due, which source it draws from,
//! and keeps the long-running loops alive.
//!
//! # Overview
//!
//! A single posting cadence is shared by a rotating set of sources. On each
//! tick the orchestrator asks the schedule whether an attempt is due, takes
//! the next active source from the rotation, runs the fetch/publish pipeline
//! behind rate limits and circuit breakers, and records the outcome. Every
//! state change is persisted before the lock guarding it is released.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Supervisor                           │
//! │   ┌──────────────┐   ┌──────────────┐   ┌────────────────┐   │
//! │   │ Orchestrator │   │   Presence   │   │ Health monitor │   │
//! │   │     loop     │   │   reporter   │   │      loop      │   │
//! │   └──────┬───────┘   └──────┬───────┘   └────────────────┘   │
//! └──────────┼──────────────────┼────────────────────────────────┘
//!            │                  │
//!     ┌──────▼──────────────────▼──────┐        ┌─────────────┐
//!     │        SchedulerContext        │◄───────│    Admin    │
//!     │  schedule  rotation  blacklist │        └─────────────┘
//!     │  rate limiter  breakers        │
//!     └──────┬─────────────────────────┘
//!            │
//!     ┌──────▼──────┐      ┌──────────────┐
//!     │ StateStore  │      │   Pipeline   │
//!     └─────────────┘      └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`schedule`] - Interval, force flag, startup grace and due evaluation
//! - [`rotation`] - Round-robin source registry with a persisted cursor
//! - [`blacklist`] - Content ids that were already published
//! - [`context`] - Shared state handed to every component
//! - [`orchestrator`] - The tick loop and a single posting attempt
//! - [`presence`] - Status derived from the schedule for observers
//! - [`admin`] - Operator commands and queries
//! - [`supervisor`] - Restart-on-failure wrapper for the background loops
//!
//! # Ordering
//!
//! After a successful publish the schedule is updated first, then the
//! rotation cursor, then the blacklist. A crash between the writes leaves
//! at worst one source retried once on the next due cycle.
//!
//! # Quick Start
//!
//! ```ignore
//! use newsrelay::scheduler::{Orchestrator, SchedulerContext};
//!
//! let ctx = Arc::new(SchedulerContext::load(&config, store, clock, pipeline, notifier)?);
//! let orchestrator = Orchestrator::new(Arc::clone(&ctx));
//! match orchestrator.tick().await {
//!     TickOutcome::Attempted { source, outcome, .. } => println!("{source}: {}", outcome.label()),
//!     other => println!("{other:?}"),
//! }
//! ```

pub mod admin;
pub mod blacklist;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod presence;
pub mod rotation;
pub mod schedule;
pub mod supervisor;

// Re-export main types
pub use admin::{Admin, StatusReport};
pub use blacklist::Blacklist;
pub use context::{Phase, RunStatus, SchedulerContext};
pub use error::{SchedulerError, SchedulerResult};
pub use orchestrator::{
    AttemptOutcome, Orchestrator, TickOutcome, PUBLISHER_DEPENDENCY, SOURCE_DEPENDENCY,
};
pub use presence::{derive_presence, Presence, PresenceReporter, PresenceSink, PresenceSinkError};
pub use rotation::{
    RotationManager, RotationState, SourceEntry, SourceFilter, SourceId, SourceStatus,
};
pub use schedule::{DueDecision, ScheduleManager, ScheduleState};
pub use supervisor::{
    task_factory, RestartPolicy, Supervisor, TaskFactory, TaskInfo, TaskStatus,
};
