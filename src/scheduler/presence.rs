//! Presence / status reporting
//!
//! [`derive_presence`] maps schedule state to what observers see. It is a
//! pure function; [`PresenceReporter`] calls it on its own tick, publishes
//! the result on a `watch` channel and forwards changes to an optional
//! [`PresenceSink`] (the target platform's status line, for instance).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use super::context::SchedulerContext;
use super::schedule::ScheduleState;

/// Observable bot status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Presence {
    /// Operator maintenance or automation disabled
    Maintenance { reason: String },
    /// Inside the window right after a publish
    JustCompleted,
    /// Waiting for the next due time
    CountingDown { seconds_remaining: i64 },
}

impl Presence {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Maintenance { .. } => "maintenance",
            Self::JustCompleted => "just_completed",
            Self::CountingDown { .. } => "counting_down",
        }
    }

    /// Status line text
    pub fn display(&self) -> String {
        match self {
            Self::Maintenance { reason } => format!("Maintenance: {reason}"),
            Self::JustCompleted => "Just posted".to_string(),
            Self::CountingDown {
                seconds_remaining: 0,
            } => "Ready to post".to_string(),
            Self::CountingDown { seconds_remaining } => {
                format!("Next post in {}", format_remaining(*seconds_remaining))
            }
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

fn format_remaining(secs: i64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Derive the presence for `now`
///
/// A due time in the past shows as zero seconds remaining.
pub fn derive_presence(state: &ScheduleState, now: DateTime<Utc>, just_posted: Duration) -> Presence {
    if state.maintenance {
        return Presence::Maintenance {
            reason: "maintenance".to_string(),
        };
    }
    if state.interval_seconds == 0 {
        return Presence::Maintenance {
            reason: "automation disabled".to_string(),
        };
    }
    if let Some(last) = state.last_success_time {
        if now >= last && now - last < just_posted {
            return Presence::JustCompleted;
        }
    }
    Presence::CountingDown {
        seconds_remaining: state.seconds_remaining(now).unwrap_or(0),
    }
}

/// Sink rejected an update
#[derive(Debug, Error)]
#[error("presence update failed: {0}")]
pub struct PresenceSinkError(pub String);

/// Where presence changes are pushed
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn update(&self, presence: &Presence) -> Result<(), PresenceSinkError>;
}

/// Periodic presence publisher
pub struct PresenceReporter {
    ctx: Arc<SchedulerContext>,
    sink: Option<Arc<dyn PresenceSink>>,
    tx: watch::Sender<Presence>,
}

impl PresenceReporter {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        let (tx, _) = watch::channel(Presence::CountingDown {
            seconds_remaining: 0,
        });
        Self { ctx, sink: None, tx }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PresenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Presence> {
        self.tx.subscribe()
    }

    /// Current presence without publishing it
    pub async fn current(&self) -> Presence {
        let now = self.ctx.now();
        let window = Duration::seconds(self.ctx.settings.just_posted_window_secs as i64);
        let schedule = self.ctx.schedule.read().await;
        derive_presence(schedule.state(), now, window)
    }

    /// Recompute and publish; returns the new presence
    pub async fn refresh(&self) -> Presence {
        let presence = self.current().await;
        let previous = self.tx.send_replace(presence.clone());

        if previous.mode() != presence.mode() {
            tracing::info!(
                from = previous.mode(),
                to = presence.mode(),
                status = %presence,
                "Presence changed"
            );
        }

        if previous != presence {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.update(&presence).await {
                    tracing::warn!(error = %e, "Presence sink update failed");
                }
            }
        }

        presence
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.ctx.settings.presence_tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
