//! Job worker for processing queued tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use kaizen_core::{defaults, Error, Job, JobRepository, KaizenConfig, Result, TaskName};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::retry::{RetryDecision, RetryPolicy};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    pub fn from_env() -> Self {
        Self::from(&KaizenConfig::from_env())
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl From<&KaizenConfig> for WorkerConfig {
    fn from(config: &KaizenConfig) -> Self {
        Self {
            poll_interval_ms: config.poll_interval_ms,
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            enabled: config.worker_enabled,
        }
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job was started.
    JobStarted { job_id: Uuid, task: TaskName },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, task: TaskName },
    /// A job gave up on a missing prerequisite or a lost race.
    JobSkipped {
        job_id: Uuid,
        task: TaskName,
        reason: String,
    },
    /// A job failed and will run again.
    JobRetrying {
        job_id: Uuid,
        task: TaskName,
        attempt: u32,
        error: String,
    },
    /// A job failed for good.
    JobFailed {
        job_id: Uuid,
        task: TaskName,
        error: String,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type Handlers = Arc<RwLock<HashMap<TaskName, Arc<dyn JobHandler>>>>;

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    config: WorkerConfig,
    runner: JobRunner,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(jobs: Arc<dyn JobRepository>, config: WorkerConfig, retry: RetryPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            config,
            runner: JobRunner {
                jobs,
                handlers: Arc::new(RwLock::new(HashMap::new())),
                retry: Arc::new(retry),
                event_tx,
            },
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.runner.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Process claimable jobs one at a time until none is left. Jobs
    /// rescheduled into the future are not waited for.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.runner.claim_job().await? {
            self.runner.clone().execute_job(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run the worker loop with concurrent job processing.
    ///
    /// Claims up to `max_concurrent_jobs` at a time and processes them concurrently.
    /// Only sleeps when the queue is empty.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            max_attempts = ?self.runner.retry.max_attempts,
            "Job worker started"
        );

        let _ = self.runner.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_concurrent = self.config.max_concurrent_jobs;

        loop {
            // Check for shutdown before claiming jobs
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            // Claim up to max_concurrent jobs
            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..max_concurrent {
                match self.runner.claim_job().await {
                    Ok(Some(job)) => {
                        claimed += 1;
                        let runner = self.runner.clone();
                        tasks.spawn(async move {
                            runner.execute_job(job).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = ?e, "Failed to claim job");
                        break;
                    }
                }
            }

            if claimed == 0 {
                // Queue empty, sleep before polling again
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(claimed, "Processing concurrent job batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
            }
        }

        let _ = self.runner.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.runner.event_tx.subscribe()
    }

    /// Get the pending job count.
    pub async fn pending_count(&self) -> Result<i64> {
        self.runner.jobs.pending_count().await
    }
}

/// Everything needed to execute one job in a spawned task.
#[derive(Clone)]
struct JobRunner {
    jobs: Arc<dyn JobRepository>,
    handlers: Handlers,
    retry: Arc<RetryPolicy>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    /// Claim the next job of a task some handler is registered for.
    async fn claim_job(&self) -> Result<Option<Job>> {
        let tasks: Vec<TaskName> = {
            let handlers = self.handlers.read().await;
            handlers.keys().copied().collect()
        };
        if tasks.is_empty() {
            return Ok(None);
        }
        self.jobs.claim_next(&tasks).await
    }

    /// Execute a single claimed job and settle it.
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let task = job.spec.task;
        let attempt = job.attempts + 1;
        let barrier_id = job.barrier_id;

        info!(
            subsystem = "jobs",
            component = "worker",
            %job_id,
            %task,
            args = ?job.spec.args,
            attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job_id, task });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&task).cloned()
        };

        let result = match handler {
            Some(handler) => handler.execute(JobContext::new(job)).await,
            None => {
                warn!(%task, "No handler registered for task");
                JobResult::Failed(format!("No handler for task: {}", task))
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        // Completing or failing a job records its barrier arrival in the
        // same write; a retry leaves the barrier untouched.
        let settled = match result {
            JobResult::Success => self.jobs.complete(job_id).await.map(|opened| {
                info!(%job_id, %task, duration_ms, "Job completed successfully");
                (WorkerEvent::JobCompleted { job_id, task }, opened)
            }),
            JobResult::Skipped(reason) => self.jobs.complete(job_id).await.map(|opened| {
                warn!(%job_id, %task, %reason, duration_ms, "Job skipped");
                (
                    WorkerEvent::JobSkipped {
                        job_id,
                        task,
                        reason,
                    },
                    opened,
                )
            }),
            JobResult::Retry(error) => match self.retry.decide(attempt) {
                RetryDecision::Retry { after } => {
                    let delay = chrono::Duration::from_std(after)
                        .unwrap_or_else(|_| chrono::Duration::days(365));
                    let not_before = Utc::now() + delay;
                    self.jobs.reschedule(job_id, not_before, &error).await.map(|_| {
                        warn!(
                            %job_id,
                            %task,
                            attempt,
                            retry_in_secs = after.as_secs(),
                            %error,
                            "Job failed, retry scheduled"
                        );
                        (
                            WorkerEvent::JobRetrying {
                                job_id,
                                task,
                                attempt,
                                error,
                            },
                            None,
                        )
                    })
                }
                RetryDecision::GiveUp => self.give_up(job_id, task, attempt, error).await,
            },
            JobResult::Failed(error) => self.give_up(job_id, task, attempt, error).await,
        };

        let (event, opened) = match settled {
            Ok(settled) => settled,
            Err(e) => {
                // The job stays running; nothing reached its barrier.
                error!(
                    error = ?e,
                    %job_id,
                    barrier_id = ?barrier_id,
                    "Failed to record job outcome"
                );
                return;
            }
        };
        let _ = self.event_tx.send(event);

        if let Some(barrier_id) = opened {
            info!(
                subsystem = "jobs",
                component = "worker",
                %job_id,
                %barrier_id,
                "Barrier opened, next stage queued"
            );
        }
    }

    async fn give_up(
        &self,
        job_id: Uuid,
        task: TaskName,
        attempt: u32,
        error: String,
    ) -> Result<(WorkerEvent, Option<Uuid>)> {
        let opened = self.jobs.fail(job_id, &error).await?;
        error!(%job_id, %task, attempt, %error, "Job failed permanently");
        Ok((
            WorkerEvent::JobFailed {
                job_id,
                task,
                error,
            },
            opened,
        ))
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    jobs: Arc<dyn JobRepository>,
    config: WorkerConfig,
    retry: RetryPolicy,
    handlers: Vec<Box<dyn JobHandler>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            config: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add several handlers.
    pub fn with_handlers<H: JobHandler + 'static>(mut self, handlers: Vec<H>) -> Self {
        for handler in handlers {
            self.handlers.push(Box::new(handler));
        }
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.jobs, self.config, self.retry);
        {
            let mut handlers = worker.runner.handlers.write().await;
            for handler in self.handlers {
                handlers.insert(handler.task(), Arc::from(handler));
            }
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_max_concurrent(0)
            .with_enabled(false);

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_config_from_kaizen_config() {
        let mut kaizen = KaizenConfig::default();
        kaizen.max_concurrent_jobs = 9;
        kaizen.worker_enabled = false;
        let config = WorkerConfig::from(&kaizen);
        assert_eq!(config.max_concurrent_jobs, 9);
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_event_clone() {
        let job_id = Uuid::now_v7();
        let event = WorkerEvent::JobRetrying {
            job_id,
            task: TaskName::Keyword,
            attempt: 2,
            error: "patch 4 not found".into(),
        };
        assert_eq!(event.clone(), event);
        assert!(format!("{:?}", event).contains("JobRetrying"));
    }
}
