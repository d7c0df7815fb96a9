//! Resource health monitor
//!
//! Samples host CPU and memory usage on a fixed tick, exports both as gauges
//! and raises an alert when a warning or critical threshold is crossed. The
//! same condition is not alerted again until `realert_secs` have passed.
//!
//! | Resource | Warning | Critical |
//! |----------|---------|----------|
//! | CPU      | 70 %    | 85 %     |
//! | Memory   | 75 %    | 90 %     |

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

use crate::clock::SharedClock;
use crate::config::HealthConfig;
use crate::metrics;
use crate::notifications::{Alert, AlertSeverity, SharedNotifier};

// ============================================================================
// Sampling
// ============================================================================

/// One reading of host resource usage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected format in {0}")]
    Parse(String),
}

/// Source of resource readings
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSample, SampleError>;
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Used memory percent from `/proc/meminfo`
fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

/// Linux `/proc` sampler
///
/// CPU usage is the busy share of jiffies since the previous sample; the
/// first sample measures since boot.
pub struct ProcSampler {
    root: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read `stat` and `meminfo` from another directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous: Mutex::new(None),
        }
    }

    fn read(&self, name: &str) -> Result<String, SampleError> {
        let path = self.root.join(name);
        std::fs::read_to_string(&path).map_err(|source| SampleError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> Result<ResourceSample, SampleError> {
        let stat = self.read("stat")?;
        let current = parse_cpu_line(&stat).ok_or_else(|| SampleError::Parse("stat".into()))?;
        let memory_percent =
            parse_meminfo(&self.read("meminfo")?).ok_or_else(|| SampleError::Parse("meminfo".into()))?;

        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let (busy, total) = match *previous {
            Some(prev) if current.total > prev.total => (
                current.busy.saturating_sub(prev.busy),
                current.total - prev.total,
            ),
            _ => (current.busy, current.total),
        };
        *previous = Some(current);

        let cpu_percent = if total == 0 {
            0.0
        } else {
            busy as f64 / total as f64 * 100.0
        };
        Ok(ResourceSample {
            cpu_percent,
            memory_percent,
        })
    }
}

// ============================================================================
// Threshold Evaluation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Normal,
    Warning,
    Critical,
}

impl Level {
    pub fn classify(value: f64, warning: f64, critical: f64) -> Self {
        if value >= critical {
            Self::Critical
        } else if value >= warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }

    fn severity(&self) -> Option<AlertSeverity> {
        match self {
            Self::Normal => None,
            Self::Warning => Some(AlertSeverity::Warning),
            Self::Critical => Some(AlertSeverity::Critical),
        }
    }
}

/// Result of one health check
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub sample: ResourceSample,
    pub cpu: Level,
    pub memory: Level,
    pub alerts_sent: usize,
}

// ============================================================================
// Monitor
// ============================================================================

pub struct HealthMonitor {
    config: HealthConfig,
    sampler: Arc<dyn ResourceSampler>,
    notifier: SharedNotifier,
    clock: SharedClock,
    last_alert: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        sampler: Arc<dyn ResourceSampler>,
        notifier: SharedNotifier,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            sampler,
            notifier,
            clock,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Sample once, export gauges and send any alert that is not suppressed
    pub async fn check(&self) -> Result<HealthReport, SampleError> {
        let sample = self.sampler.sample()?;
        metrics::set_health(sample.cpu_percent, sample.memory_percent);

        let cpu = Level::classify(sample.cpu_percent, self.config.cpu_warning, self.config.cpu_critical);
        let memory = Level::classify(
            sample.memory_percent,
            self.config.memory_warning,
            self.config.memory_critical,
        );
        tracing::debug!(
            cpu_percent = sample.cpu_percent,
            memory_percent = sample.memory_percent,
            "Resource sample"
        );

        let mut pending = Vec::new();
        if let Some(alert) = self.threshold_alert("cpu", cpu, sample.cpu_percent) {
            pending.push(alert);
        }
        if let Some(alert) = self.threshold_alert("memory", memory, sample.memory_percent) {
            pending.push(alert);
        }

        let alerts_sent = pending.len();
        for alert in pending {
            self.notifier.deliver(alert).await;
        }

        Ok(HealthReport {
            sample,
            cpu,
            memory,
            alerts_sent,
        })
    }

    fn threshold_alert(&self, resource: &str, level: Level, value: f64) -> Option<Alert> {
        let severity = level.severity()?;
        let condition = format!("{resource}_{}", severity.as_str());
        let now = self.clock.now();

        {
            let mut last_alert = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = last_alert.get(&condition) {
                if now - *last < Duration::seconds(self.config.realert_secs as i64) {
                    tracing::debug!(condition = %condition, "Health alert suppressed");
                    return None;
                }
            }
            last_alert.insert(condition.clone(), now);
        }

        let threshold = match (resource, level) {
            ("cpu", Level::Critical) => self.config.cpu_critical,
            ("cpu", _) => self.config.cpu_warning,
            (_, Level::Critical) => self.config.memory_critical,
            _ => self.config.memory_warning,
        };
        Some(
            Alert::new(
                severity,
                format!("{resource} usage at {value:.1}% (threshold {threshold:.0}%)"),
            )
            .with_source("health")
            .with_condition(condition),
        )
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let period = std::time::Duration::from_secs(self.config.tick_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(tick_secs = self.config.tick_secs, "Health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        tracing::warn!(error = %e, "Resource sampling failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Health monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notifications::RecordingNotifier;
    use chrono::TimeZone;

    const STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const MEMINFO: &str = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    200 kB\n";

    #[test]
    fn test_parse_cpu_line() {
        let times = parse_cpu_line(STAT).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 200);
        assert!(parse_cpu_line("intr 1 2 3").is_none());
    }

    #[test]
    fn test_parse_meminfo() {
        let used = parse_meminfo(MEMINFO).unwrap();
        assert!((used - 80.0).abs() < 1e-9);
        assert!(parse_meminfo("MemTotal: 1000 kB\n").is_none());
    }

    #[test]
    fn test_proc_sampler_uses_delta() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), STAT).unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        let sampler = ProcSampler::with_root(dir.path());

        let first = sampler.sample().unwrap();
        assert!((first.cpu_percent - 20.0).abs() < 1e-9);

        // +100 busy, +100 idle since the previous read
        std::fs::write(dir.path().join("stat"), "cpu  200 0 100 800 100 0 0 0\n").unwrap();
        let second = sampler.sample().unwrap();
        assert!((second.cpu_percent - 50.0).abs() < 1e-9);
        assert!((second.memory_percent - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_proc_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = ProcSampler::with_root(dir.path());
        assert!(matches!(sampler.sample(), Err(SampleError::Io { .. })));
    }

    #[test]
    fn test_level_classification() {
        assert_eq!(Level::classify(50.0, 70.0, 85.0), Level::Normal);
        assert_eq!(Level::classify(70.0, 70.0, 85.0), Level::Warning);
        assert_eq!(Level::classify(99.0, 70.0, 85.0), Level::Critical);
    }

    struct FixedSampler(Mutex<ResourceSample>);

    impl ResourceSampler for FixedSampler {
        fn sample(&self) -> Result<ResourceSample, SampleError> {
            Ok(*self.0.lock().unwrap())
        }
    }

    fn monitor(
        cpu: f64,
        memory: f64,
    ) -> (HealthMonitor, Arc<FixedSampler>, Arc<RecordingNotifier>, ManualClock) {
        let sampler = Arc::new(FixedSampler(Mutex::new(ResourceSample {
            cpu_percent: cpu,
            memory_percent: memory,
        })));
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap());
        let monitor = HealthMonitor::new(
            HealthConfig::default(),
            sampler.clone(),
            notifier.clone(),
            Arc::new(clock.clone()),
        );
        (monitor, sampler, notifier, clock)
    }

    #[tokio::test]
    async fn test_healthy_sample_sends_nothing() {
        let (monitor, _, notifier, _) = monitor(10.0, 20.0);
        let report = monitor.check().await.unwrap();
        assert_eq!(report.cpu, Level::Normal);
        assert_eq!(report.alerts_sent, 0);
        assert!(notifier.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_realert_guard() {
        let (monitor, _, notifier, clock) = monitor(90.0, 20.0);

        let report = monitor.check().await.unwrap();
        assert_eq!(report.cpu, Level::Critical);
        assert_eq!(report.alerts_sent, 1);

        clock.advance_secs(600);
        assert_eq!(monitor.check().await.unwrap().alerts_sent, 0);

        clock.advance_secs(3000);
        assert_eq!(monitor.check().await.unwrap().alerts_sent, 1);

        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].condition.as_deref(), Some("cpu_critical"));
        assert_eq!(alerts[0].source, "health");
    }

    #[tokio::test]
    async fn test_conditions_are_guarded_separately() {
        let (monitor, sampler, notifier, _) = monitor(75.0, 80.0);
        assert_eq!(monitor.check().await.unwrap().alerts_sent, 2);

        // Escalating to critical is a new condition
        sampler.0.lock().unwrap().cpu_percent = 95.0;
        assert_eq!(monitor.check().await.unwrap().alerts_sent, 1);

        let conditions: Vec<_> = notifier
            .alerts()
            .into_iter()
            .filter_map(|a| a.condition)
            .collect();
        assert_eq!(conditions, vec!["cpu_warning", "memory_warning", "cpu_critical"]);
    }
}
