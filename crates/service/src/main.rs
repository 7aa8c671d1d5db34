use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use mt_domain::config::{Config, ConfigSeverity, ServerConfig};
use mt_service::api;
use mt_service::cli::{Cli, Command, ConfigCommand};
use mt_service::queue::{spawn_consumers, QueueHub};
use mt_service::runtime::dispatcher::WebhookDispatcher;
use mt_service::runtime::scheduler::JobScheduler;
use mt_service::runtime::worker::AggregationWorker;
use mt_service::runtime::{AGGREGATION_QUEUE, WEBHOOK_QUEUE};
use mt_service::state::AppState;
use mt_service::store::memory::{
    MemoryAggregationStore, MemoryEventStore, MemoryJobBoard, MemoryLockService,
};
use mt_service::store::{AggregationStore, EventStore, JobBoard, LockService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = mt_service::cli::load_config(cli.config.as_deref())?;
            tracing::info!(path = %config_path.display(), "configuration loaded");
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = mt_service::cli::load_config(cli.config.as_deref())?;
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => println!("warning: {issue}"),
                    ConfigSeverity::Error => println!("error: {issue}"),
                }
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("{} is valid", config_path.display());
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = mt_service::cli::load_config(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("meterd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mt_service=debug")),
        )
        .json()
        .init();
}

/// `DRY_RUN` environment flag; overrides `[delivery].dry_run`.
fn dry_run_enabled(config: &Config) -> bool {
    match std::env::var("DRY_RUN") {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => config.delivery.dry_run,
    }
}

/// Start the metering service with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("meterd starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }
    tracing::info!(
        periods = config.periods.len(),
        event_types = config.events.len(),
        webhooks = config.enabled_webhooks().count(),
        "configuration validated"
    );

    // ── Stores ───────────────────────────────────────────────────────
    let queue = Arc::new(QueueHub::new());
    let events: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let aggregations: Arc<dyn AggregationStore> = Arc::new(MemoryAggregationStore::new());
    let jobs: Arc<dyn JobBoard> = Arc::new(MemoryJobBoard::new(queue.clone()));
    let locks: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
    tracing::info!("stores ready");

    // ── Engine ───────────────────────────────────────────────────────
    let scheduler = Arc::new(JobScheduler::new(
        config.clone(),
        events.clone(),
        aggregations.clone(),
        jobs.clone(),
    ));
    let worker = Arc::new(AggregationWorker::new(
        config.clone(),
        events.clone(),
        aggregations.clone(),
        jobs.clone(),
        locks.clone(),
        queue.clone(),
    ));
    let dry_run = dry_run_enabled(&config);
    if dry_run {
        tracing::warn!("DRY_RUN enabled — webhook deliveries will be simulated");
    }
    let dispatcher = Arc::new(
        WebhookDispatcher::new(aggregations.clone(), dry_run)
            .context("initializing webhook dispatcher")?,
    );
    tracing::info!("aggregation engine ready");

    // ── Queue consumers ──────────────────────────────────────────────
    let parallelism = config.scheduler.worker_parallelism;
    {
        let worker = worker.clone();
        spawn_consumers(queue.clone(), AGGREGATION_QUEUE, parallelism, move |payload| {
            let worker = worker.clone();
            async move {
                let job = serde_json::from_value(payload)?;
                worker.process(job).await.map(|_| ())
            }
        });
    }
    {
        let dispatcher = dispatcher.clone();
        spawn_consumers(queue.clone(), WEBHOOK_QUEUE, parallelism, move |payload| {
            let dispatcher = dispatcher.clone();
            async move {
                let job = serde_json::from_value(payload)?;
                dispatcher.deliver(job).await
            }
        });
    }
    tracing::info!(parallelism, "queue consumers started");

    // ── Cron scheduler ───────────────────────────────────────────────
    {
        let scheduler = scheduler.clone();
        let interval_secs = config.scheduler.cron_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // The first tick fires immediately; skip it so startup is not
            // a scheduler pass.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.cron_pass(chrono::Utc::now()).await {
                    tracing::error!(error = %e, "cron pass failed");
                }
            }
        });
        tracing::info!(interval_secs, "cron scheduler started");
    }

    // ── Stuck-job recovery (requeue rows stuck in `queued`) ──────────
    {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            interval.tick().await;
            loop {
                interval.tick().await;
                match jobs.requeue_stuck(chrono::Duration::minutes(30)).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(requeued = n, "recovered stuck jobs"),
                    Err(e) => tracing::warn!(error = %e, "stuck-job recovery failed"),
                }
            }
        });
    }

    // ── App state ────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        events,
        aggregations,
        jobs,
        locks,
        queue,
        scheduler,
        worker,
        dispatcher,
    };

    // ── Router ───────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server);
    let app = api::router()
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "meterd listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins. A literal
/// `"*"` allows all origins.
fn build_cors_layer(server: &ServerConfig) -> CorsLayer {
    use axum::http::header;

    let origins = &server.cors_allowed_origins;
    if origins.len() == 1 && origins[0] == "*" {
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    for origin in origins {
        match origin.parse::<HeaderValue>() {
            Ok(hv) => exact.push(hv),
            Err(_) => tracing::warn!(origin = %origin, "invalid CORS origin, skipping"),
        }
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(exact))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
