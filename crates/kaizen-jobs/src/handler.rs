//! Job handler capability.

use async_trait::async_trait;

use kaizen_core::{Error, Job, Result, TaskName};

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn task(&self) -> TaskName {
        self.job.spec.task
    }

    pub fn args(&self) -> &[i64] {
        &self.job.spec.args
    }

    /// Positional argument `i`.
    pub fn arg(&self, i: usize) -> Result<i64> {
        self.args().get(i).copied().ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} expects {} argument(s), got {:?}",
                self.task(),
                self.task().arity(),
                self.args()
            ))
        })
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job did its work.
    Success,
    /// A prerequisite was missing or a race was lost; nothing to retry.
    Skipped(String),
    /// The job should be retried after a delay.
    Retry(String),
    /// The job can never succeed.
    Failed(String),
}

impl JobResult {
    /// Classify the outcome of a unit of work.
    ///
    /// Soft errors skip, malformed input fails outright, everything else is
    /// handed to the retry policy.
    pub fn from_outcome<T>(outcome: Result<T>) -> Self {
        match outcome {
            Ok(_) => JobResult::Success,
            Err(e) if e.is_soft() => JobResult::Skipped(e.to_string()),
            Err(e @ Error::InvalidInput(_)) => JobResult::Failed(e.to_string()),
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }

    /// Whether the job is finished (as opposed to waiting for a retry).
    pub fn is_final(&self) -> bool {
        !matches!(self, JobResult::Retry(_))
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The task this handler processes.
    fn task(&self) -> TaskName;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}
