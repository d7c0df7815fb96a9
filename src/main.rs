use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use newsrelay::api::{self, AppState};
use newsrelay::clock::system_clock;
use newsrelay::config::Config;
use newsrelay::metrics;
use newsrelay::monitoring::{HealthMonitor, ProcSampler};
use newsrelay::notifications::{CompositeNotifier, LogNotifier, SharedNotifier, WebhookNotifier};
use newsrelay::pipeline::{HttpPipeline, SharedPipeline};
use newsrelay::scheduler::{
    task_factory, Admin, Orchestrator, PresenceReporter, RestartPolicy, SchedulerContext,
    Supervisor,
};
use newsrelay::error::RelayErrorTrait;
use newsrelay::store::open_store;

#[derive(Parser)]
#[command(
    name = "newsrelay",
    version,
    about = "Scheduled fetch-translate-publish relay with source rotation and circuit breakers",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, background monitors and admin API
    Run {
        /// TOML config file; environment variables are used without it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the persisted state snapshot as JSON
    State {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Run { config } | Commands::CheckConfig { config } | Commands::State { config } => {
            config.clone()
        }
    };
    let config = Config::load(config_path.as_deref())?;

    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(log_format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Run { .. } => run(config).await,
        Commands::CheckConfig { .. } => check_config(&config),
        Commands::State { .. } => print_state(&config),
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("newsrelay=debug,tower_http=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("newsrelay={level},warn"))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    config.validate()?;
    println!("Configuration OK");
    println!("  Storage: {:?} at {}", config.storage.backend, config.storage.path.display());
    println!("  Tick: {}s, startup grace: {}s", config.scheduler.tick_secs, config.scheduler.startup_grace_secs);
    println!("  Seed sources: {}", config.scheduler.seed_sources.len());
    println!(
        "  Pipeline: {}",
        if config.pipeline.is_some() { "configured" } else { "missing" }
    );
    let mut deps: Vec<_> = config.breakers.keys().collect();
    deps.sort();
    println!("  Breakers: {}", deps.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(", "));
    Ok(())
}

fn print_state(config: &Config) -> Result<()> {
    let store = open_store(config.storage.backend, &config.storage.path)
        .context("Failed to open state store")?;
    let snapshot = store.snapshot().context("Failed to read state store")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn build_notifier(config: &Config) -> Result<SharedNotifier> {
    let mut notifier = CompositeNotifier::new().with(Arc::new(LogNotifier));
    if let Some(webhook) = &config.notifications.webhook {
        let channel = WebhookNotifier::new(webhook.clone()).context("Invalid webhook notifier")?;
        tracing::info!(url = channel.url(), "Webhook alerts enabled");
        notifier = notifier.with(Arc::new(channel));
    }
    Ok(Arc::new(notifier))
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;
    tracing::info!("newsrelay starting");

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let store = open_store(config.storage.backend, &config.storage.path)
        .context("Failed to open state store")?;
    let pipeline_config = config.pipeline.clone().context(
        "No pipeline endpoints configured (set [pipeline] or NEWSRELAY_FETCH_URL and NEWSRELAY_PUBLISH_URL)",
    )?;
    let pipeline: SharedPipeline =
        Arc::new(HttpPipeline::new(pipeline_config).context("Failed to build pipeline client")?);
    let notifier = build_notifier(&config)?;
    let clock = system_clock();

    let ctx = match SchedulerContext::load(
        &config,
        store,
        Arc::clone(&clock),
        pipeline,
        Arc::clone(&notifier),
    ) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!(
                category = %e.category(),
                recoverable = e.is_recoverable(),
                error = %e,
                "Failed to load scheduler state"
            );
            return Err(anyhow::Error::new(e).context("Failed to load scheduler state"));
        }
    };

    let mut supervisor = Supervisor::new(Arc::clone(&notifier));

    let orchestrator = Orchestrator::new(Arc::clone(&ctx));
    supervisor.spawn(
        "orchestrator",
        RestartPolicy::default(),
        task_factory(move |shutdown| orchestrator.clone().run(shutdown)),
    );

    let presence = Arc::new(PresenceReporter::new(Arc::clone(&ctx)));
    supervisor.spawn(
        "presence",
        RestartPolicy::default(),
        task_factory(move |shutdown| Arc::clone(&presence).run(shutdown)),
    );

    if config.health.enabled {
        let monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            Arc::new(ProcSampler::new()),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));
        supervisor.spawn(
            "health",
            RestartPolicy::default(),
            task_factory(move |shutdown| Arc::clone(&monitor).run(shutdown)),
        );
    }

    let api_task = if config.api.enabled {
        let addr: SocketAddr = config
            .api
            .bind_address
            .parse()
            .context("Invalid api.bind_address")?;
        let router = api::create_router(AppState::new(Admin::new(Arc::clone(&ctx))));
        let mut stop = supervisor.shutdown_signal();
        Some(tokio::spawn(async move {
            let signal = async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            };
            if let Err(e) = api::serve(addr, router, signal).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    let grace = config.scheduler.shutdown_grace();
    supervisor.shutdown(grace).await;
    if let Some(handle) = api_task {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("Admin API did not stop within grace period");
        }
    }

    ctx.flush_pending().await;
    if !ctx.persistence_healthy().await {
        tracing::error!("Exiting with unpersisted scheduler state");
    }
    tracing::info!("newsrelay stopped");
    Ok(())
}
