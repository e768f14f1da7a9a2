use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opsqueue::{
    config::Config,
    database::{Database, SqliteJobStore},
    jobs::{ExecutionFramework, WorkerRegistry},
    recurrence::engine::{RecurrenceEngine, SeriesExpansionWorker},
    scheduler::{
        tasks::{
            ScheduleExecutionWorker, ScheduleTaskRegistry, TARGET_HISTORY_CLEANUP,
            TARGET_SERIES_EXPANSION_SWEEP,
        },
        SchedulerService,
    },
    workers::{LogNotificationTransport, NotificationDispatchWorker},
};

#[derive(Parser)]
#[command(name = "opsqueue")]
#[command(version = "0.3.0")]
#[command(about = "Job processing and recurrence scheduling engine")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = format!("opsqueue={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting opsqueue engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from specified file
    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    info!("Using database: {}", config.database.url);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    // Built-in schedules; operators add their own rows next to these
    database
        .ensure_schedule(
            "series-expansion-sweep",
            TARGET_SERIES_EXPANSION_SWEEP,
            "15 * * * *",
            "UTC",
        )
        .await?;
    database
        .ensure_schedule("history-cleanup", TARGET_HISTORY_CLEANUP, "40 3 * * *", "UTC")
        .await?;

    let store = Arc::new(SqliteJobStore::new(database.pool()));

    let engine = RecurrenceEngine::new(
        database.clone(),
        store.clone(),
        config.recurrence.clone(),
    );
    let task_registry = Arc::new(ScheduleTaskRegistry::with_builtin_tasks());

    let registry = Arc::new(
        WorkerRegistry::new()
            .register(Arc::new(NotificationDispatchWorker::new(vec![Arc::new(
                LogNotificationTransport,
            )])))
            .register(Arc::new(SeriesExpansionWorker::new(engine)))
            .register(Arc::new(ScheduleExecutionWorker::new(
                database.clone(),
                store.clone(),
                task_registry,
                config.recurrence.clone(),
                config.scheduler.clone(),
            ))),
    );

    let cancellation_token = CancellationToken::new();

    // Queue workers and the scheduler tick run decoupled: cron
    // evaluation never competes with job execution
    let framework = ExecutionFramework::new(store.clone(), registry, config.executor.clone());
    let framework_token = cancellation_token.clone();
    let framework_handle = tokio::spawn(async move {
        if let Err(e) = framework.run(framework_token).await {
            error!("Execution framework failed: {}", e);
        }
    });

    let scheduler = SchedulerService::new(database, store, config.scheduler.clone());
    let scheduler_token = cancellation_token.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.run(scheduler_token).await {
            error!("Scheduler service failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancellation_token.cancel();

    let _ = scheduler_handle.await;
    let _ = framework_handle.await;

    info!("opsqueue engine stopped");
    Ok(())
}
