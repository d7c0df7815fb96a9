//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use newsrelay::clock::{ManualClock, SharedClock};
use newsrelay::config::Config;
use newsrelay::notifications::RecordingNotifier;
use newsrelay::pipeline::{ContentBatch, ContentItem, Pipeline, PipelineError};
use newsrelay::scheduler::{AttemptOutcome, Orchestrator, SchedulerContext, SourceId, TickOutcome};
use newsrelay::store::SharedStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Fixed start time for every scenario
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
}

/// Pipeline whose behaviour is scripted per source
#[derive(Default)]
pub struct FakePipeline {
    failing: Mutex<HashSet<String>>,
    items: Mutex<HashMap<String, Vec<String>>>,
    pub fetched: Mutex<Vec<String>>,
    pub published: Mutex<Vec<String>>,
}

impl FakePipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make fetches from `source` fail with a transport error
    pub fn fail(&self, source: &str) {
        self.failing.lock().unwrap().insert(source.to_string());
    }

    pub fn recover(&self, source: &str) {
        self.failing.lock().unwrap().remove(source);
    }

    /// Content ids `source` returns, newest first
    pub fn offer(&self, source: &str, ids: &[&str]) {
        self.items
            .lock()
            .unwrap()
            .insert(source.to_string(), ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Pipeline for FakePipeline {
    async fn fetch_candidate_content(
        &self,
        source: &SourceId,
    ) -> Result<Option<ContentBatch>, PipelineError> {
        self.fetched.lock().unwrap().push(source.to_string());
        if self.failing.lock().unwrap().contains(source.as_str()) {
            return Err(PipelineError::Transport("connection refused".into()));
        }
        let ids = self.items.lock().unwrap().get(source.as_str()).cloned();
        Ok(ids.map(|ids| ContentBatch {
            source: source.to_string(),
            items: ids
                .into_iter()
                .map(|id| ContentItem {
                    id,
                    text: "headline".into(),
                    media_urls: vec![],
                    posted_at: None,
                })
                .collect(),
        }))
    }

    async fn translate_and_publish(
        &self,
        _source: &SourceId,
        item: &ContentItem,
    ) -> Result<bool, PipelineError> {
        self.published.lock().unwrap().push(item.id.clone());
        Ok(true)
    }
}

/// Everything a scenario needs to drive the orchestrator
pub struct Relay {
    pub orchestrator: Orchestrator,
    pub clock: ManualClock,
    pub pipeline: Arc<FakePipeline>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Relay {
    pub fn ctx(&self) -> &Arc<SchedulerContext> {
        self.orchestrator.context()
    }

    pub async fn tick(&self) -> TickOutcome {
        self.orchestrator.tick().await
    }

    pub async fn cursor(&self) -> usize {
        self.ctx().rotation.read().await.state().cursor
    }
}

/// Config with no startup grace and the given seed sources
pub fn config(sources: &[&str]) -> Config {
    let mut config = Config::default();
    config.scheduler.startup_grace_secs = 0;
    config.scheduler.seed_sources = sources.iter().map(|s| s.to_string()).collect();
    config
}

/// Build a relay over `store`, starting the clock at `start`
pub fn relay_with(
    config: &Config,
    store: SharedStore,
    start: DateTime<Utc>,
    pipeline: Arc<FakePipeline>,
) -> Relay {
    let clock = ManualClock::new(start);
    let shared: SharedClock = Arc::new(clock.clone());
    let notifier = Arc::new(RecordingNotifier::new());
    let ctx = SchedulerContext::load(config, store, shared, pipeline.clone(), notifier.clone())
        .expect("scheduler context should load");
    Relay {
        orchestrator: Orchestrator::new(Arc::new(ctx)),
        clock,
        pipeline,
        notifier,
    }
}

/// Source and outcome of an attempted tick
pub fn attempted(outcome: &TickOutcome) -> (String, AttemptOutcome) {
    match outcome {
        TickOutcome::Attempted {
            source, outcome, ..
        } => (source.to_string(), outcome.clone()),
        other => panic!("expected an attempt, got {other:?}"),
    }
}
