//! Configuration management for newsrelay
//!
//! Configuration comes from a TOML file (`--config`) or from `NEWSRELAY_*`
//! environment variables layered over the defaults. Every section has
//! defaults, so a file only needs the values it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::notifications::WebhookConfig;
use crate::pipeline::HttpPipelineConfig;
use crate::resilience::{default_breakers, default_limits, BreakerConfig, RateLimitConfig};
use crate::store::StoreBackend;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Orchestrator and presence timing
    pub scheduler: SchedulerConfig,

    /// Token buckets by dependency name
    pub rate_limits: HashMap<String, RateLimitConfig>,

    /// Circuit breakers by dependency name
    pub breakers: HashMap<String, BreakerConfig>,

    /// Resource health monitor
    pub health: HealthConfig,

    /// Persistent state store
    pub storage: StorageConfig,

    /// HTTP pipeline endpoints; without them `run` refuses to start
    pub pipeline: Option<HttpPipelineConfig>,

    /// Alert channels
    pub notifications: NotificationsConfig,

    /// Admin HTTP API
    pub api: ApiConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            rate_limits: default_limits(),
            breakers: default_breakers(),
            health: HealthConfig::default(),
            storage: StorageConfig::default(),
            pipeline: None,
            notifications: NotificationsConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Orchestrator timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between due checks
    pub tick_secs: u64,

    /// Quiet period after process start
    pub startup_grace_secs: u64,

    /// How long presence shows "just posted"
    pub just_posted_window_secs: u64,

    /// Upper bound on one fetch-translate-publish attempt
    pub pipeline_timeout_secs: u64,

    /// Longest rate-limit wait an attempt accepts before giving up
    pub max_admission_wait_secs: u64,

    /// Seconds between presence refreshes
    pub presence_tick_secs: u64,

    /// Time background loops get to finish on shutdown
    pub shutdown_grace_secs: u64,

    /// Sources activated at startup when not yet known
    pub seed_sources: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            startup_grace_secs: 120,
            just_posted_window_secs: 60,
            pipeline_timeout_secs: 300,
            max_admission_wait_secs: 10,
            presence_tick_secs: 30,
            shutdown_grace_secs: 10,
            seed_sources: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    #[must_use]
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }

    #[must_use]
    pub fn max_admission_wait(&self) -> Duration {
        Duration::from_secs(self.max_admission_wait_secs)
    }

    #[must_use]
    pub fn presence_tick(&self) -> Duration {
        Duration::from_secs(self.presence_tick_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Resource health thresholds (percent)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    /// Minimum seconds between two alerts for the same condition
    pub realert_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
            cpu_warning: 70.0,
            cpu_critical: 85.0,
            memory_warning: 75.0,
            memory_critical: 90.0,
            realert_secs: 3600,
        }
    }
}

/// State store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            path: PathBuf::from("data/state.json"),
        }
    }
}

/// Alert channels; alerts are always logged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhook: Option<WebhookConfig>,
}

/// Admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: String::from("127.0.0.1:8088"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

// A file that names any dependency replaces the whole table; the built-in
// ones must always be present.
fn with_builtin<T: Copy>(
    mut configured: HashMap<String, T>,
    builtin: HashMap<String, T>,
) -> HashMap<String, T> {
    for (name, value) in builtin {
        configured.entry(name).or_insert(value);
    }
    configured
}

fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {name}: {e}")),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        let scheduler = &mut config.scheduler;
        if let Some(v) = env_var("NEWSRELAY_TICK_SECS")? {
            scheduler.tick_secs = v;
        }
        if let Some(v) = env_var("NEWSRELAY_STARTUP_GRACE_SECS")? {
            scheduler.startup_grace_secs = v;
        }
        if let Some(v) = env_var("NEWSRELAY_PIPELINE_TIMEOUT_SECS")? {
            scheduler.pipeline_timeout_secs = v;
        }
        if let Ok(sources) = std::env::var("NEWSRELAY_SOURCES") {
            scheduler.seed_sources = sources
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = env_var::<StoreBackend>("NEWSRELAY_STORAGE_BACKEND")? {
            config.storage.backend = v;
        }
        if let Ok(path) = std::env::var("NEWSRELAY_STORAGE_PATH") {
            config.storage.path = PathBuf::from(path);
        }

        if let Ok(bind) = std::env::var("NEWSRELAY_API_BIND") {
            config.api.bind_address = bind;
        }
        if let Some(v) = env_var("NEWSRELAY_API_ENABLED")? {
            config.api.enabled = v;
        }

        if let (Ok(fetch_url), Ok(publish_url)) = (
            std::env::var("NEWSRELAY_FETCH_URL"),
            std::env::var("NEWSRELAY_PUBLISH_URL"),
        ) {
            config.pipeline = Some(HttpPipelineConfig {
                fetch_url,
                publish_url,
                auth_token: std::env::var("NEWSRELAY_PIPELINE_TOKEN").ok(),
                request_timeout_secs: env_var("NEWSRELAY_PIPELINE_REQUEST_TIMEOUT_SECS")?
                    .unwrap_or(60),
            });
        }

        if let Ok(url) = std::env::var("NEWSRELAY_WEBHOOK_URL") {
            let mut webhook = WebhookConfig::new(url);
            webhook.auth_token = std::env::var("NEWSRELAY_WEBHOOK_TOKEN").ok();
            config.notifications.webhook = Some(webhook);
        }

        if let Ok(level) = std::env::var("NEWSRELAY_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("NEWSRELAY_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config.with_builtin_dependencies())
    }

    /// File when given, environment otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    fn with_builtin_dependencies(mut self) -> Self {
        self.rate_limits = with_builtin(self.rate_limits, default_limits());
        self.breakers = with_builtin(self.breakers, default_breakers());
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_secs == 0 {
            anyhow::bail!("scheduler.tick_secs must be greater than 0");
        }
        if s.pipeline_timeout_secs == 0 {
            anyhow::bail!("scheduler.pipeline_timeout_secs must be greater than 0");
        }
        if s.presence_tick_secs == 0 {
            anyhow::bail!("scheduler.presence_tick_secs must be greater than 0");
        }

        for (name, limit) in &self.rate_limits {
            limit
                .validate()
                .map_err(|e| anyhow::anyhow!("rate_limits.{name}: {e}"))?;
        }
        for (name, breaker) in &self.breakers {
            breaker
                .validate()
                .map_err(|e| anyhow::anyhow!("breakers.{name}: {e}"))?;
        }

        let h = &self.health;
        if h.tick_secs == 0 {
            anyhow::bail!("health.tick_secs must be greater than 0");
        }
        if h.cpu_warning > h.cpu_critical {
            anyhow::bail!("health.cpu_warning must not exceed health.cpu_critical");
        }
        if h.memory_warning > h.memory_critical {
            anyhow::bail!("health.memory_warning must not exceed health.memory_critical");
        }

        if let Some(pipeline) = &self.pipeline {
            pipeline
                .validate()
                .map_err(|e| anyhow::anyhow!("pipeline: {e}"))?;
        }
        if let Some(webhook) = &self.notifications.webhook {
            webhook
                .validate()
                .map_err(|e| anyhow::anyhow!("notifications.webhook: {e}"))?;
        }

        if self.api.enabled {
            self.api
                .bind_address
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("api.bind_address '{}' is invalid", self.api.bind_address))?;
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }
}
