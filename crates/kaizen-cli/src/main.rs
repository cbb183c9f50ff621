//! kaizen: run one task in-process, or serve the task queue as a worker.
//!
//! ```text
//! kaizen dataset 1
//! kaizen analyze_blob 1 42
//! kaizen --drain keyword 7
//! kaizen worker
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kaizen_core::{BlobStore, JobRepository, KaizenConfig, Store, TaskName, TaskSpec};
use kaizen_db::{Database, FilesystemBlobStore, MemoryJobRepository, MemoryStore, PoolConfig};
use kaizen_features::{ExtractorPool, ExtractorRegistry, FeatureCache};
use kaizen_jobs::{
    Dispatcher, InlineRunner, JobWorker, RetryPolicy, TaskEnv, TaskHandler, WorkerBuilder,
    WorkerConfig, WorkerEvent,
};
use kaizen_learn::{EngineConfig, LinearSvmFactory, RoundEngine};

#[derive(Parser)]
#[command(name = "kaizen")]
#[command(author, version, about = "Active-learning rounds over image patches")]
#[command(propagate_version = true)]
struct Cli {
    /// Use a throwaway in-memory store and queue instead of PostgreSQL
    #[arg(long, global = true)]
    memory: bool,

    /// After the task, process queued follow-up work here until none is left
    #[arg(long, global = true)]
    drain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process queued tasks until interrupted
    Worker,

    /// Run one task: <task_name> <id>...
    #[command(external_subcommand)]
    Task(Vec<String>),
}

/// Parse `<task_name> <id>...` into a task spec.
fn parse_task(words: &[String]) -> anyhow::Result<TaskSpec> {
    let Some((name, ids)) = words.split_first() else {
        bail!("missing task name");
    };
    let task: TaskName = name.parse().map_err(anyhow::Error::msg)?;
    let args = ids
        .iter()
        .map(|id| {
            id.parse::<i64>()
                .with_context(|| format!("{} expects integer ids, got '{}'", task, id))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    if args.len() != task.arity() {
        bail!(
            "{} expects {} id(s), got {}",
            task,
            task.arity(),
            args.len()
        );
    }
    Ok(TaskSpec::new(task, args))
}

/// Install the global subscriber.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, rotated daily)
///   LOG_ANSI    - "true"/"false" override ANSI colors
///   RUST_LOG    - standard env filter (default: "kaizen=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kaizen=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = Path::new(path);
        let file_dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("kaizen.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Connect the store and queue.
async fn connect(
    memory: bool,
    config: &KaizenConfig,
) -> anyhow::Result<(Arc<dyn Store>, Arc<dyn JobRepository>)> {
    if memory {
        warn!("Using the in-memory store; nothing outlives this process");
        return Ok((
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryJobRepository::new()),
        ));
    }

    info!("Connecting to database...");
    let pool = PoolConfig::for_workers(config.max_concurrent_jobs);
    let db = Database::connect_with_config(&config.database_url, pool)
        .await
        .context("connecting to the database")?;
    db.migrate().await.context("running migrations")?;
    info!("Database ready");
    Ok((Arc::new(db.store), Arc::new(db.jobs)))
}

fn task_env(
    config: &KaizenConfig,
    store: Arc<dyn Store>,
    jobs: Arc<dyn JobRepository>,
) -> TaskEnv {
    let blobs: Arc<dyn BlobStore> = Arc::new(FilesystemBlobStore::new(
        config.blob_dir.clone(),
        config.cache_dir.clone(),
    ));
    let extractors = Arc::new(ExtractorPool::new(ExtractorRegistry::with_defaults(config)));
    let features = FeatureCache::new(store.clone(), blobs.clone(), extractors);
    let dispatcher = Dispatcher::new(jobs);
    let engine = RoundEngine::new(
        store,
        blobs,
        features,
        Arc::new(LinearSvmFactory::from_config(config)),
        Arc::new(dispatcher.clone()),
        EngineConfig::from(config),
    );
    TaskEnv::new(engine, dispatcher)
}

async fn worker(
    env: TaskEnv,
    jobs: Arc<dyn JobRepository>,
    config: &KaizenConfig,
) -> JobWorker {
    WorkerBuilder::new(jobs)
        .with_config(WorkerConfig::from(config))
        .with_retry_policy(RetryPolicy::from_config(config))
        .with_handlers(TaskHandler::all(Arc::new(env)))
        .build()
        .await
}

/// Serve the queue until interrupted, then stop after the current batch.
async fn serve(worker: JobWorker, enabled: bool) -> anyhow::Result<()> {
    if !enabled {
        warn!("JOB_WORKER_ENABLED is false, nothing to do");
        return Ok(());
    }
    let handle = worker.start();
    let mut events = handle.events();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupt received, finishing current batch");
    handle.shutdown().await?;

    while let Ok(event) = events.recv().await {
        if event == WorkerEvent::WorkerStopped {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();
    let config = KaizenConfig::from_env();

    match cli.command {
        Command::Worker => {
            let (store, jobs) = connect(cli.memory, &config).await?;
            let env = task_env(&config, store, jobs.clone());
            serve(worker(env, jobs, &config).await, config.worker_enabled).await
        }
        Command::Task(words) => {
            let spec = parse_task(&words)?;
            let (store, jobs) = connect(cli.memory, &config).await?;
            let env = task_env(&config, store, jobs.clone());

            InlineRunner::new(env.clone()).run(&spec).await?;

            // Nothing else can see an in-memory queue.
            if cli.drain || cli.memory {
                let worker = worker(env, jobs, &config).await;
                let processed = worker.drain().await?;
                info!(
                    processed,
                    pending = worker.pending_count().await?,
                    "Follow-up work drained"
                );
            }
            Ok(())
        }
    }
}
