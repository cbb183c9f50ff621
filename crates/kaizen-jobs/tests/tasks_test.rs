//! The task catalogue end to end: inline runner, queue and worker over the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use kaizen_core::*;
use kaizen_db::{MemoryBlobStore, MemoryJobRepository, MemoryStore};
use kaizen_features::{ExtractorPool, ExtractorRegistry, FeatureCache};
use kaizen_jobs::{
    Dispatcher, InlineRunner, JobWorker, RetryPolicy, TaskEnv, TaskHandler, WorkerBuilder,
};
use kaizen_learn::{EngineConfig, LinearSvmFactory, RoundEngine};
use serde_json::json;

struct Ctx {
    store: MemoryStore,
    blobs: MemoryBlobStore,
    jobs: MemoryJobRepository,
    env: TaskEnv,
    dataset: Dataset,
    blob: Blob,
    dir: tempfile::TempDir,
}

async fn setup() -> Ctx {
    let store = MemoryStore::new();
    let blobs = MemoryBlobStore::new();
    let jobs = MemoryJobRepository::new();
    let grid = store
        .create_patch_spec(&NewPatchSpec {
            name: "tiles".into(),
            width: 8,
            height: 8,
            x_overlap: 0.0,
            y_overlap: 0.0,
            fliplr: false,
        })
        .await
        .unwrap();
    let dataset = store.create_dataset("reef", Some(grid.id)).await.unwrap();
    let blob = store.create_blob(dataset.id, "survey/reef.png").await.unwrap();
    blobs
        .insert(
            blob.id,
            RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 90])),
        )
        .unwrap();
    store
        .create_feature_spec(dataset.id, ExtractorKind::ColorHist, json!({"bins": 2}))
        .await
        .unwrap();
    store
        .create_feature_spec(dataset.id, ExtractorKind::TinyImage, json!({"flatten": true}))
        .await
        .unwrap();

    let config = KaizenConfig::default()
        .with_query_num(1)
        .with_threshold(0.0)
        .with_release_interval(1);
    let pool = Arc::new(ExtractorPool::new(ExtractorRegistry::with_defaults(&config)));
    let features = FeatureCache::new(Arc::new(store.clone()), Arc::new(blobs.clone()), pool);
    let dispatcher = Dispatcher::new(Arc::new(jobs.clone()));
    let engine = RoundEngine::new(
        Arc::new(store.clone()),
        Arc::new(blobs.clone()),
        features,
        Arc::new(LinearSvmFactory::from_config(&config)),
        Arc::new(dispatcher.clone()),
        EngineConfig::from(&config),
    );

    Ctx {
        store,
        blobs,
        jobs,
        env: TaskEnv::new(engine, dispatcher),
        dataset,
        blob,
        dir: tempfile::tempdir().unwrap(),
    }
}

impl Ctx {
    async fn keyword(&self, definition: &str) -> Keyword {
        let path = self.dir.path().join("coral.csv");
        std::fs::write(&path, definition).unwrap();
        self.store
            .create_keyword(self.dataset.id, "coral", path.to_str())
            .await
            .unwrap()
    }

    fn runner(&self) -> InlineRunner {
        InlineRunner::new(self.env.clone())
    }

    async fn worker(&self) -> JobWorker {
        WorkerBuilder::new(Arc::new(self.jobs.clone()))
            .with_retry_policy(
                RetryPolicy::default()
                    .with_delay(Duration::ZERO)
                    .with_max_attempts(Some(2)),
            )
            .with_handlers(TaskHandler::all(Arc::new(self.env.clone())))
            .build()
            .await
    }
}

#[tokio::test]
async fn test_dataset_task_drives_first_round() {
    let ctx = setup().await;
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    let (classifier, zero) = ctx
        .store
        .create_classifier(kw.id, ctx.dataset.id)
        .await
        .unwrap();

    ctx.runner()
        .run(&TaskSpec::new(TaskName::Dataset, vec![ctx.dataset.id]))
        .await
        .unwrap();
    assert_eq!(
        ctx.jobs.pending_specs().unwrap(),
        vec![TaskSpec::new(
            TaskName::AnalyzeBlob,
            vec![ctx.dataset.id, ctx.blob.id]
        )]
    );

    // analyze_blob -> keyword -> classifier -> precrop_round_results
    let worker = ctx.worker().await;
    assert_eq!(worker.drain().await.unwrap(), 4);

    let tasks: Vec<_> = ctx
        .jobs
        .jobs()
        .unwrap()
        .into_iter()
        .map(|j| (j.spec, j.status))
        .collect();
    assert_eq!(
        tasks,
        vec![
            (
                TaskSpec::new(TaskName::AnalyzeBlob, vec![ctx.dataset.id, ctx.blob.id]),
                JobStatus::Completed
            ),
            (
                TaskSpec::new(TaskName::Keyword, vec![kw.id]),
                JobStatus::Completed
            ),
            (
                TaskSpec::new(TaskName::Classifier, vec![classifier.id]),
                JobStatus::Completed
            ),
            (
                TaskSpec::new(TaskName::PrecropRoundResults, vec![zero.id]),
                JobStatus::Completed
            ),
        ]
    );

    assert_eq!(ctx.store.keyword_seeds(kw.id).await.unwrap().len(), 1);
    assert_eq!(ctx.store.round_examples(zero.id).await.unwrap().len(), 2);
    assert_eq!(ctx.store.round_predictions(zero.id).await.unwrap().len(), 14);
    assert_eq!(ctx.store.round_queries(zero.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_keyword_without_classifier_dispatches_nothing() {
    let ctx = setup().await;
    ctx.env
        .engine
        .analyze_blob(ctx.dataset.id, ctx.blob.id)
        .await
        .unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;

    let renders = ctx.blobs.render_count();
    ctx.runner()
        .run(&TaskSpec::new(TaskName::Keyword, vec![kw.id]))
        .await
        .unwrap();

    assert_eq!(ctx.store.keyword_seeds(kw.id).await.unwrap().len(), 1);
    assert!(ctx.blobs.render_count() > renders);
    assert!(ctx.jobs.jobs().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_dataset_pipeline_enqueues_nothing() {
    let ctx = setup().await;
    let empty = ctx.store.create_dataset("empty", None).await.unwrap();

    ctx.runner()
        .run(&TaskSpec::new(TaskName::Dataset, vec![empty.id]))
        .await
        .unwrap();
    assert!(ctx.jobs.jobs().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_prerequisite_is_not_an_error() {
    let ctx = setup().await;
    let detection = ctx.store.create_detection(ctx.blob.id).await.unwrap();

    // No "Dense" patch spec exists.
    ctx.runner()
        .run(&TaskSpec::new(TaskName::Detect, vec![detection.id]))
        .await
        .unwrap();

    let id = ctx
        .env
        .dispatcher
        .dispatch(TaskSpec::new(TaskName::Detect, vec![detection.id]))
        .await
        .unwrap();
    ctx.worker().await.drain().await.unwrap();
    let job = ctx.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_wrong_arity_fails_without_retry() {
    let ctx = setup().await;
    let err = ctx
        .runner()
        .run(&TaskSpec::new(TaskName::Classifier, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let id = ctx
        .env
        .dispatcher
        .dispatch(TaskSpec::new(TaskName::AnalyzeBlob, vec![ctx.dataset.id]))
        .await
        .unwrap();
    assert_eq!(ctx.worker().await.drain().await.unwrap(), 1);
    let job = ctx.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_missing_entity_is_retried_until_ceiling() {
    let ctx = setup().await;
    let id = ctx
        .env
        .dispatcher
        .dispatch(TaskSpec::new(TaskName::AdvanceClassifier, vec![404]))
        .await
        .unwrap();

    assert_eq!(ctx.worker().await.drain().await.unwrap(), 2);
    let job = ctx.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn test_done_is_a_no_op() {
    let ctx = setup().await;
    ctx.runner()
        .run(&TaskSpec::new(TaskName::Done, vec![]))
        .await
        .unwrap();
    assert!(ctx.jobs.jobs().unwrap().is_empty());
}
