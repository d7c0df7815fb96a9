//! Supervised background loops
//!
//! Each long-running loop (orchestrator, presence, health) runs as a tokio
//! task under a [`RestartPolicy`]. A loop that returns an error or panics is
//! restarted after an exponential backoff, unless it has already used up its
//! restarts inside the policy window; then it is marked [`TaskStatus::Failed`]
//! and a critical alert goes out.
//!
//! All loops share one `watch` shutdown channel. [`Supervisor::shutdown`]
//! flips it, waits for the grace period and aborts whatever is still running.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::notifications::{Alert, AlertSeverity, SharedNotifier};

/// When and how fast to restart a failed loop
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed inside `restart_window`
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub base_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            base_backoff: Duration::from_secs(2),
            backoff_factor: 1.5,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `restart` (1-based)
    pub fn backoff(&self, restart: u32) -> Duration {
        if restart == 0 {
            return Duration::ZERO;
        }
        let exponential =
            self.base_backoff.as_secs_f64() * self.backoff_factor.powi((restart - 1) as i32);
        Duration::from_secs_f64(exponential.min(self.max_backoff.as_secs_f64()))
    }
}

/// Lifecycle of a supervised task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Restarting,
    Stopped,
    Failed,
}

/// Observable state of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub status: TaskStatus,
    pub restarts: u32,
    pub last_error: Option<String>,
}

/// Builds a fresh run of a loop from the shutdown receiver
pub type TaskFactory = Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async loop constructor as a [`TaskFactory`]
pub fn task_factory<F, Fut>(f: F) -> TaskFactory
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |shutdown| f(shutdown).boxed())
}

type TaskTable = Arc<Mutex<HashMap<String, TaskInfo>>>;

/// Owner of every background loop
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
    tasks: TaskTable,
    notifier: SharedNotifier,
}

impl Supervisor {
    pub fn new(notifier: SharedNotifier) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            notifier,
        }
    }

    /// Receiver for code that is not supervised but must stop with the rest
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start `factory` under `policy`
    pub fn spawn(&mut self, name: impl Into<String>, policy: RestartPolicy, factory: TaskFactory) {
        let name = name.into();
        set_info(&self.tasks, &name, TaskStatus::Running, 0, None);

        let handle = tokio::spawn(supervise(
            name.clone(),
            policy,
            factory,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.notifier),
        ));
        tracing::info!(task = %name, "Supervised task started");
        self.handles.push((name, handle));
    }

    pub fn status(&self, name: &str) -> Option<TaskInfo> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn statuses(&self) -> Vec<TaskInfo> {
        let mut all: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Signal shutdown and wait up to `grace` for every task
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + grace;

        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => tracing::debug!(task = %name, "Task finished"),
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not stop within grace period, aborting");
                    handle.abort();
                    set_status(&self.tasks, &name, TaskStatus::Stopped);
                }
            }
        }
        tracing::info!("All supervised tasks stopped");
    }
}

fn set_info(tasks: &TaskTable, name: &str, status: TaskStatus, restarts: u32, last_error: Option<String>) {
    tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(
        name.to_string(),
        TaskInfo {
            name: name.to_string(),
            status,
            restarts,
            last_error,
        },
    );
}

fn set_status(tasks: &TaskTable, name: &str, status: TaskStatus) {
    if let Some(info) = tasks.lock().unwrap_or_else(|e| e.into_inner()).get_mut(name) {
        info.status = status;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

async fn supervise(
    name: String,
    policy: RestartPolicy,
    factory: TaskFactory,
    mut shutdown: watch::Receiver<bool>,
    tasks: TaskTable,
    notifier: SharedNotifier,
) {
    let mut recent_restarts: VecDeque<Instant> = VecDeque::new();
    let mut total_restarts = 0u32;

    loop {
        set_status(&tasks, &name, TaskStatus::Running);
        let run = AssertUnwindSafe(factory(shutdown.clone())).catch_unwind().await;

        let error = match run {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(payload) => Some(panic_message(payload)),
        };

        if *shutdown.borrow() {
            set_status(&tasks, &name, TaskStatus::Stopped);
            return;
        }
        let Some(error) = error else {
            tracing::info!(task = %name, "Task exited");
            set_status(&tasks, &name, TaskStatus::Stopped);
            return;
        };

        let now = Instant::now();
        while recent_restarts
            .front()
            .is_some_and(|t| now.duration_since(*t) > policy.restart_window)
        {
            recent_restarts.pop_front();
        }

        if recent_restarts.len() as u32 >= policy.max_restarts {
            tracing::error!(
                task = %name,
                restarts = total_restarts,
                error = %error,
                "Task exceeded restart budget, giving up"
            );
            set_info(&tasks, &name, TaskStatus::Failed, total_restarts, Some(error.clone()));
            notifier
                .deliver(
                    Alert::new(
                        AlertSeverity::Critical,
                        format!("Background task '{name}' stopped after repeated failures: {error}"),
                    )
                    .with_source("supervisor")
                    .with_condition(format!("task:{name}")),
                )
                .await;
            return;
        }

        recent_restarts.push_back(now);
        total_restarts += 1;
        let delay = policy.backoff(recent_restarts.len() as u32);
        tracing::warn!(
            task = %name,
            restart = total_restarts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Task failed, restarting"
        );
        set_info(&tasks, &name, TaskStatus::Restarting, total_restarts, Some(error));

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                set_status(&tasks, &name, TaskStatus::Stopped);
                return;
            }
        }
    }
}
