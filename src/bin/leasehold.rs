//! Operator command line for a leasehold queue.
//!
//! Usage:
//!
//! ```text
//! leasehold [--config <path>] [--database <path>] <command> [args]
//! ```
//!
//! Structured results are printed to stdout as JSON; diagnostics go to
//! stderr through `tracing`.

use clap::{Args, Parser, Subcommand};
use leasehold::config::QueueConfig;
use leasehold::queue::adapters::sqlite::{SCHEMA_VERSION, SqliteQueueRepository};
use leasehold::queue::domain::{TagSet, TaskFilter, TaskId, TaskStatus, TaskType};
use leasehold::queue::metrics::QueueMetrics;
use leasehold::queue::services::{
    EnqueueRequest, LeaseManager, MaintenanceService, QueueService, StatusUpdate, Sweeper,
    TaskStatusView,
};
use mockable::DefaultClock;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Boxed error type for the main result.
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Durable single-host task queue.
#[derive(Parser, Debug)]
#[command(name = "leasehold", version, about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, env = "LEASEHOLD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database file; overrides `storage.path` from the configuration.
    #[arg(short, long, env = "LEASEHOLD_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and schema if missing.
    Init,
    /// Add a task.
    Enqueue(EnqueueArgs),
    /// Show the status of a task.
    Status {
        /// Task identifier.
        id: i64,
    },
    /// List tasks.
    List(ListArgs),
    /// Cancel a queued or leased task.
    Cancel {
        /// Task identifier.
        id: i64,
    },
    /// Force a task into a new status.
    SetStatus {
        /// Task identifier.
        id: i64,
        /// Target status (queued, completed, failed, cancelled).
        status: String,
        /// Reason recorded with the change.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show queue statistics.
    Stats,
    /// Show the audit log of a task.
    Logs {
        /// Task identifier.
        id: i64,
    },
    /// Reclaim expired leases once.
    Reclaim,
    /// Run maintenance jobs once.
    Maintain(MaintainArgs),
    /// Print Prometheus metrics.
    Metrics,
    /// Run lease reclamation and maintenance until interrupted.
    Sweep,
}

#[derive(Args, Debug)]
struct EnqueueArgs {
    /// Task type.
    task_type: String,
    /// Payload text.
    #[arg(long, conflicts_with = "payload_file")]
    payload: Option<String>,
    /// File whose bytes form the payload.
    #[arg(long)]
    payload_file: Option<PathBuf>,
    /// Priority; smaller runs first.
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    priority: i32,
    /// Compatibility tag as `key=value`; repeatable.
    #[arg(short, long = "tag")]
    tags: Vec<String>,
    /// Attempt budget.
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Deduplication key.
    #[arg(long)]
    idempotency_key: Option<String>,
    /// Delay before the first run, in seconds.
    #[arg(long)]
    delay_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Only tasks in this status.
    #[arg(long)]
    status: Option<String>,
    /// Only tasks of this type.
    #[arg(long = "type")]
    task_type: Option<String>,
    /// Only tasks carrying this `key=value` tag; repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Maximum rows.
    #[arg(long)]
    limit: Option<u32>,
    /// Rows to skip.
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Args, Debug)]
struct MaintainArgs {
    /// Prune old terminal tasks and logs.
    #[arg(long)]
    prune: bool,
    /// Checkpoint the write-ahead log.
    #[arg(long)]
    checkpoint: bool,
    /// Write a backup to the configured directory.
    #[arg(long)]
    backup: bool,
}

impl MaintainArgs {
    const fn all(&self) -> bool {
        !self.prune && !self.checkpoint && !self.backup
    }
}

type Repository = SqliteQueueRepository;

struct App {
    config: QueueConfig,
    queue: QueueService<Repository, DefaultClock>,
    leases: Arc<LeaseManager<Repository, DefaultClock>>,
    maintenance: Arc<MaintenanceService<Repository, DefaultClock>>,
    metrics: Arc<QueueMetrics>,
}

impl App {
    fn open(config: QueueConfig) -> Result<Self, BoxError> {
        let repository = Arc::new(SqliteQueueRepository::open(&config.storage)?);
        let clock = Arc::new(DefaultClock);
        let metrics = Arc::new(QueueMetrics::new()?);

        let queue = QueueService::new(Arc::clone(&repository), Arc::clone(&clock))
            .with_registry(config.tasks.registry()?)
            .with_metrics(Arc::clone(&metrics));
        let leases = Arc::new(
            LeaseManager::new(
                Arc::clone(&repository),
                Arc::clone(&clock),
                config.strategy.build(),
                config.lease.clone(),
                config.retry.backoff_policy(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let maintenance = Arc::new(MaintenanceService::new(
            repository,
            clock,
            config.maintenance.clone(),
        ));
        Ok(Self {
            config,
            queue,
            leases,
            maintenance,
            metrics,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    leasehold::telemetry::init(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => QueueConfig::load(path)?,
        None => QueueConfig::default(),
    };
    if let Some(database) = cli.database {
        config.storage.path = database;
    }

    let app = App::open(config)?;
    run(&app, cli.command).await
}

async fn run(app: &App, command: Command) -> Result<(), BoxError> {
    match command {
        Command::Init => {
            emit_json(&serde_json::json!({
                "database": app.config.storage.path,
                "schema_version": SCHEMA_VERSION,
            }))
        }
        Command::Enqueue(args) => enqueue(app, args).await,
        Command::Status { id } => emit_json(&app.queue.get_task_status(TaskId::new(id)).await?),
        Command::List(args) => list(app, args).await,
        Command::Cancel { id } => {
            let cancelled = app.queue.cancel_task(TaskId::new(id)).await?;
            emit_json(&serde_json::json!({ "task_id": id, "cancelled": cancelled }))
        }
        Command::SetStatus { id, status, reason } => {
            let mut update = StatusUpdate::new(TaskStatus::try_from(status.as_str())?);
            if let Some(text) = reason {
                update = update.with_error_message(text);
            }
            let task = app.queue.update_status(TaskId::new(id), update).await?;
            emit_json(&TaskStatusView::from(&task))
        }
        Command::Stats => emit_json(&app.queue.stats().await?),
        Command::Logs { id } => emit_json(&app.queue.task_logs(TaskId::new(id)).await?),
        Command::Reclaim => {
            let report = app.leases.reclaim_expired_leases().await?;
            emit_json(&serde_json::json!({
                "examined": report.examined,
                "reclaimed": report.reclaimed,
                "failed": report.failed,
            }))
        }
        Command::Maintain(args) => maintain(app, &args).await,
        Command::Metrics => {
            app.queue.stats().await?;
            emit(&app.metrics.render()?)
        }
        Command::Sweep => sweep(app).await,
    }
}

async fn enqueue(app: &App, args: EnqueueArgs) -> Result<(), BoxError> {
    let payload = match (args.payload, args.payload_file) {
        (_, Some(path)) => std::fs::read(path)?,
        (Some(text), None) => text.into_bytes(),
        (None, None) => Vec::new(),
    };
    let mut request = EnqueueRequest::new(args.task_type, payload)
        .with_priority(args.priority)
        .with_tags(args.tags);
    if let Some(max_attempts) = args.max_attempts {
        request = request.with_max_attempts(max_attempts);
    }
    if let Some(key) = args.idempotency_key {
        request = request.with_idempotency_key(key);
    }
    if let Some(secs) = args.delay_secs {
        request = request.with_delay(Duration::from_secs(secs));
    }
    emit_json(&app.queue.enqueue(request).await?)
}

async fn list(app: &App, args: ListArgs) -> Result<(), BoxError> {
    let mut filter = TaskFilter::new()
        .with_tags(TagSet::parse(&args.tags)?)
        .with_offset(args.offset);
    if let Some(status) = args.status {
        filter = filter.with_status(TaskStatus::try_from(status.as_str())?);
    }
    if let Some(task_type) = args.task_type {
        filter = filter.with_task_type(TaskType::new(task_type)?);
    }
    if let Some(limit) = args.limit {
        filter = filter.with_limit(limit);
    }
    emit_json(&app.queue.list_tasks(&filter).await?)
}

#[derive(Serialize)]
struct MaintainOutput {
    tasks_pruned: Option<u64>,
    logs_pruned: Option<u64>,
    checkpointed: bool,
    backup: Option<PathBuf>,
}

async fn maintain(app: &App, args: &MaintainArgs) -> Result<(), BoxError> {
    let mut output = MaintainOutput {
        tasks_pruned: None,
        logs_pruned: None,
        checkpointed: false,
        backup: None,
    };
    if args.all() || args.prune {
        let pruned = app.maintenance.prune().await?;
        output.tasks_pruned = Some(pruned.tasks_removed);
        output.logs_pruned = Some(pruned.logs_removed);
    }
    if args.all() || args.checkpoint {
        app.maintenance.checkpoint().await?;
        output.checkpointed = true;
    }
    if args.all() || args.backup {
        output.backup = app.maintenance.backup().await?;
    }
    emit_json(&output)
}

async fn sweep(app: &App) -> Result<(), BoxError> {
    let handle = Sweeper::new(Arc::clone(&app.leases), Arc::clone(&app.maintenance)).spawn();
    info!("sweeper running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

fn emit_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    emit(&serde_json::to_string_pretty(value)?)
}

fn emit(text: &str) -> Result<(), BoxError> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{text}")?;
    Ok(())
}
