//! Alert delivery
//!
//! Components raise alerts through the [`Notifier`] trait and never wait on
//! the outcome: [`Notifier::notify`] logs a delivery failure and returns.
//!
//! ```text
//!  Orchestrator ─┐
//!  HealthMonitor ┼──▶ CompositeNotifier ──┬──▶ LogNotifier
//!  Supervisor ───┘                        └──▶ WebhookNotifier
//! ```

pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use webhook::{WebhookConfig, WebhookNotifier};

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational alerts for tracking purposes
    Info,
    /// Warning alerts that require attention
    Warning,
    /// Critical alerts requiring immediate action
    Critical,
}

impl AlertSeverity {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Get emoji representation
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Critical => "🚨",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert identifier
    pub id: String,

    /// Alert severity
    pub severity: AlertSeverity,

    /// Component that raised the alert
    pub source: String,

    /// Human-readable message
    pub message: String,

    /// Condition that produced the alert, for grouping repeats
    pub condition: Option<String>,

    /// When the alert was raised
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            severity,
            source: "newsrelay".to_string(),
            message: message.into(),
            condition: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// One-line rendering for log sinks and chat channels
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] {}: {}",
            self.severity.emoji(),
            self.severity.as_str().to_uppercase(),
            self.source,
            self.message
        )
    }
}

/// Delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Invalid channel configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network or connection error
    #[error("Network error: {0}")]
    Network(String),

    /// Remote side refused the alert
    #[error("Rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Alert sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs
    fn name(&self) -> &str;

    /// Deliver one alert
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;

    /// Fire-and-forget delivery
    async fn deliver(&self, alert: Alert) {
        if let Err(e) = self.send(&alert).await {
            tracing::warn!(
                channel = self.name(),
                alert_id = %alert.id,
                error = %e,
                "Failed to deliver alert"
            );
        }
    }

    /// Fire-and-forget `severity`/`message` alert
    async fn notify(&self, severity: AlertSeverity, message: &str) {
        self.deliver(Alert::new(severity, message)).await;
    }
}

/// Shared notifier handle
pub type SharedNotifier = Arc<dyn Notifier>;

/// Writes alerts to the tracing log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.severity {
            AlertSeverity::Info => {
                tracing::info!(source = %alert.source, condition = ?alert.condition, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                tracing::warn!(source = %alert.source, condition = ?alert.condition, "{}", alert.message)
            }
            AlertSeverity::Critical => {
                tracing::error!(source = %alert.source, condition = ?alert.condition, "{}", alert.message)
            }
        }
        Ok(())
    }
}

/// Fans an alert out to several notifiers
#[derive(Default)]
pub struct CompositeNotifier {
    channels: Vec<SharedNotifier>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: SharedNotifier) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    fn name(&self) -> &str {
        "composite"
    }

    /// Every channel is tried; the first failure is reported
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let results = futures::future::join_all(self.channels.iter().map(|c| c.send(alert))).await;
        let mut first_err = None;
        for (channel, result) in self.channels.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(channel = channel.name(), error = %e, "Alert channel failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Collects alerts in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: std::sync::Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _alert: &Alert) -> Result<(), NotifyError> {
            Err(NotifyError::Network("unreachable".into()))
        }
    }

    #[test]
    fn test_alert_summary() {
        let alert = Alert::new(AlertSeverity::Critical, "CPU at 97%").with_source("health");
        let summary = alert.summary();
        assert!(summary.contains("CRITICAL"));
        assert!(summary.contains("health"));
        assert!(summary.contains("CPU at 97%"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Warning);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }

    #[tokio::test]
    async fn test_composite_reaches_every_channel() {
        let recorder = Arc::new(RecordingNotifier::new());
        let composite = CompositeNotifier::new()
            .with(Arc::new(FailingNotifier))
            .with(recorder.clone());

        let result = composite
            .send(&Alert::new(AlertSeverity::Warning, "disk"))
            .await;
        assert!(result.is_err());
        assert_eq!(recorder.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_swallows_failures() {
        let failing = FailingNotifier;
        failing.notify(AlertSeverity::Info, "ignored").await;
    }
}
