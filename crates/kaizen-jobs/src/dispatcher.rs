//! Dispatching tasks and multi-stage pipelines.
//!
//! A [`Pipeline`] is a list of stages; every task of a stage runs in
//! parallel and the next stage starts once all of them have finished,
//! successfully or not. Stage boundaries are durable barriers in the queue:
//! the barrier counts outstanding members and carries the remaining stages
//! as its continuation, so a pipeline survives worker restarts. The queue
//! writes a stage and its barrier together, and settles a member, records
//! its arrival and queues the next stage together.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use kaizen_core::{Continuation, Dispatch, JobRepository, Result, TaskSpec};

/// Ordered stages of parallel tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    stages: Continuation,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. An empty stage is passed through immediately.
    pub fn stage(mut self, tasks: Vec<TaskSpec>) -> Self {
        self.stages.push(tasks);
        self
    }

    pub fn into_stages(self) -> Continuation {
        self.stages
    }
}

/// Enqueues tasks and opens pipeline stages.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: Arc<dyn JobRepository>,
}

impl Dispatcher {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }

    /// Start a pipeline. Returns the barrier guarding the first non-empty
    /// stage, if a later stage depends on it.
    pub async fn dispatch_pipeline(&self, pipeline: Pipeline) -> Result<Option<Uuid>> {
        let stages = pipeline.into_stages();
        let barrier = self.jobs.enqueue_stages(&stages).await?;
        debug!(
            subsystem = "jobs",
            component = "dispatcher",
            stages = stages.iter().filter(|s| !s.is_empty()).count(),
            barrier_id = ?barrier,
            "Pipeline dispatched"
        );
        Ok(barrier)
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, spec: TaskSpec) -> Result<Uuid> {
        let id = self.jobs.enqueue(&spec, None).await?;
        debug!(
            subsystem = "jobs",
            component = "dispatcher",
            job_id = %id,
            task = %spec.task,
            args = ?spec.args,
            "Task dispatched"
        );
        Ok(id)
    }
}
