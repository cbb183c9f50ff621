//! Handlers for the task catalogue.
//!
//! Every task is a thin adapter: validate the integer arguments, call the
//! round engine, and dispatch follow-up work once the engine's writes have
//! returned.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use kaizen_core::{Dispatch, Error, Result, TaskName, TaskSpec};
use kaizen_learn::RoundEngine;

use crate::dispatcher::{Dispatcher, Pipeline};
use crate::handler::{JobContext, JobHandler, JobResult};

/// Everything a task needs.
#[derive(Clone)]
pub struct TaskEnv {
    pub engine: RoundEngine,
    pub dispatcher: Dispatcher,
}

impl TaskEnv {
    pub fn new(engine: RoundEngine, dispatcher: Dispatcher) -> Self {
        Self { engine, dispatcher }
    }
}

fn check_arity(spec: &TaskSpec) -> Result<()> {
    if spec.args.len() != spec.task.arity() {
        return Err(Error::InvalidInput(format!(
            "{} expects {} argument(s), got {:?}",
            spec.task,
            spec.task.arity(),
            spec.args
        )));
    }
    Ok(())
}

/// Run one task to completion in the calling task.
pub async fn run_task(env: &TaskEnv, spec: &TaskSpec) -> Result<()> {
    check_arity(spec)?;
    let engine = &env.engine;
    let args = &spec.args;

    match spec.task {
        TaskName::Dataset => dataset(env, args[0]).await,
        TaskName::AnalyzeBlob => engine.analyze_blob(args[0], args[1]).await.map(drop),
        TaskName::Keyword => keyword(env, args[0]).await,
        TaskName::Classifier => engine.initialize(args[0]).await.map(drop),
        TaskName::AdvanceClassifier => engine.advance(args[0]).await.map(drop),
        TaskName::PrecropRoundResults => engine.precrop_round(args[0]).await.map(drop),
        TaskName::Detect => engine.detect(args[0]).await.map(drop),
        TaskName::Done => Ok(()),
    }
}

/// Analyze every blob, then seed every keyword.
async fn dataset(env: &TaskEnv, dataset_id: i64) -> Result<()> {
    let store = env.engine.store();
    let dataset = store.get_dataset(dataset_id).await?;
    let blobs = store.dataset_blobs(dataset.id).await?;
    let keywords = store.dataset_keywords(dataset.id).await?;

    let pipeline = Pipeline::new()
        .stage(
            blobs
                .iter()
                .map(|b| TaskSpec::new(TaskName::AnalyzeBlob, vec![dataset.id, b.id]))
                .collect(),
        )
        .stage(
            keywords
                .iter()
                .map(|k| TaskSpec::new(TaskName::Keyword, vec![k.id]))
                .collect(),
        );
    let barrier = env.dispatcher.dispatch_pipeline(pipeline).await?;

    info!(
        subsystem = "jobs",
        component = "tasks",
        op = "dataset",
        dataset_id,
        blobs = blobs.len(),
        keywords = keywords.len(),
        barrier_id = ?barrier,
        "Dataset pipeline dispatched"
    );
    Ok(())
}

/// Seed a keyword, render its seed patches, then start its classifier.
async fn keyword(env: &TaskEnv, keyword_id: i64) -> Result<()> {
    let engine = &env.engine;
    engine.seed_keyword(keyword_id).await?;
    engine.materialize_seeds(keyword_id).await?;

    let classifier = engine.store().classifier_for_keyword(keyword_id).await?;
    let queued = env
        .dispatcher
        .dispatch_if(TaskName::Classifier, classifier.map(|c| c.id))
        .await?;
    debug!(
        subsystem = "jobs",
        component = "tasks",
        op = "keyword",
        keyword_id,
        classifier_queued = queued.is_some(),
        "Keyword processed"
    );
    Ok(())
}

/// Worker handler for one task of the catalogue.
pub struct TaskHandler {
    task: TaskName,
    env: Arc<TaskEnv>,
}

impl TaskHandler {
    pub fn new(task: TaskName, env: Arc<TaskEnv>) -> Self {
        Self { task, env }
    }

    /// One handler per task name.
    pub fn all(env: Arc<TaskEnv>) -> Vec<TaskHandler> {
        TaskName::ALL
            .iter()
            .map(|&task| TaskHandler::new(task, env.clone()))
            .collect()
    }
}

#[async_trait]
impl JobHandler for TaskHandler {
    fn task(&self) -> TaskName {
        self.task
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let start = Instant::now();
        let result = JobResult::from_outcome(run_task(&self.env, &ctx.job.spec).await);
        debug!(
            subsystem = "jobs",
            component = "tasks",
            task = %self.task,
            job_id = %ctx.job.id,
            result = ?result,
            duration_ms = start.elapsed().as_millis() as u64,
            "Task executed"
        );
        result
    }
}
