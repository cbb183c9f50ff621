//! Round engine scenarios over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use kaizen_core::*;
use kaizen_db::{MemoryBlobStore, MemoryStore};
use kaizen_features::{ColorHist, ExtractorPool, ExtractorRegistry, FeatureCache, FeatureExtractor};
use kaizen_learn::{EngineConfig, Estimator, EstimatorFactory, LinearSvmFactory, RoundEngine};
use ndarray::{ArrayView1, ArrayView2};
use serde_json::json;
use uuid::Uuid;

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<TaskSpec>>,
}

impl RecordingDispatcher {
    fn sent(&self) -> Vec<TaskSpec> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatcher {
    async fn dispatch(&self, spec: TaskSpec) -> Result<Uuid> {
        self.sent.lock().unwrap().push(spec);
        Ok(Uuid::now_v7())
    }
}

/// Wraps an estimator factory; the next `failures` trainings fail with a
/// retryable error.
struct FlakyEstimators {
    inner: LinearSvmFactory,
    failures: Arc<AtomicUsize>,
}

struct FlakyEstimator {
    inner: Box<dyn Estimator>,
    failures: Arc<AtomicUsize>,
}

impl EstimatorFactory for FlakyEstimators {
    fn create(&self) -> Box<dyn Estimator> {
        Box::new(FlakyEstimator {
            inner: self.inner.create(),
            failures: self.failures.clone(),
        })
    }

    fn threshold(&self) -> f32 {
        self.inner.threshold()
    }
}

impl Estimator for FlakyEstimator {
    fn train(&mut self, examples: ArrayView2<'_, f32>, labels: &[bool]) -> Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Estimator("transient".into()));
        }
        self.inner.train(examples, labels)
    }

    fn score(&self, vector: ArrayView1<'_, f32>) -> Result<f32> {
        self.inner.score(vector)
    }

    fn threshold(&self) -> f32 {
        self.inner.threshold()
    }
}

struct Ctx {
    store: MemoryStore,
    blobs: MemoryBlobStore,
    dispatcher: Arc<RecordingDispatcher>,
    engine: RoundEngine,
    extractors: Arc<ExtractorPool>,
    hist_builds: Arc<AtomicUsize>,
    training_failures: Arc<AtomicUsize>,
    dataset: Dataset,
    blob: Blob,
    dir: tempfile::TempDir,
}

fn reef() -> RgbImage {
    RgbImage::from_fn(32, 32, |x, y| {
        Rgb([(x * 8) as u8, (y * 8) as u8, ((x * y) % 256) as u8])
    })
}

async fn setup(query_num: usize) -> Ctx {
    let store = MemoryStore::new();
    let blobs = MemoryBlobStore::new();
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
    blobs.insert(blob.id, reef()).unwrap();
    store
        .create_feature_spec(dataset.id, ExtractorKind::ColorHist, json!({"bins": 2}))
        .await
        .unwrap();
    store
        .create_feature_spec(dataset.id, ExtractorKind::TinyImage, json!({"flatten": true}))
        .await
        .unwrap();

    let hist_builds = Arc::new(AtomicUsize::new(0));
    let mut registry = ExtractorRegistry::with_defaults(&KaizenConfig::default());
    let builds = hist_builds.clone();
    registry.register(
        ExtractorKind::ColorHist,
        Arc::new(move || {
            builds.fetch_add(1, Ordering::SeqCst);
            Box::new(ColorHist::default()) as Box<dyn FeatureExtractor>
        }),
    );
    let extractors = Arc::new(ExtractorPool::new(registry));
    let features = FeatureCache::new(
        Arc::new(store.clone()),
        Arc::new(blobs.clone()),
        extractors.clone(),
    );
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let training_failures = Arc::new(AtomicUsize::new(0));
    let config = KaizenConfig::default()
        .with_query_num(query_num)
        .with_threshold(0.0)
        .with_release_interval(1);
    let engine = RoundEngine::new(
        Arc::new(store.clone()),
        Arc::new(blobs.clone()),
        features,
        Arc::new(FlakyEstimators {
            inner: LinearSvmFactory::from_config(&config),
            failures: training_failures.clone(),
        }),
        dispatcher.clone(),
        EngineConfig::from(&config),
    );

    Ctx {
        store,
        blobs,
        dispatcher,
        engine,
        extractors,
        hist_builds,
        training_failures,
        dataset,
        blob,
        dir: tempfile::tempdir().unwrap(),
    }
}

impl Ctx {
    async fn keyword(&self, definition: &str) -> Keyword {
        let path = self.dir.path().join(format!("kw{}.csv", definition.len()));
        std::fs::write(&path, definition).unwrap();
        self.store
            .create_keyword(self.dataset.id, "coral", path.to_str())
            .await
            .unwrap()
    }

    fn fail_next_training(&self, n: usize) {
        self.training_failures.store(n, Ordering::SeqCst);
    }

    async fn patch_at(&self, x: i32, y: i32) -> Patch {
        self.store
            .ensure_patch(&PatchKey::new(self.blob.id, x, y, 8, 8))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_analyze_blob_builds_grid_and_features() {
    let ctx = setup(1).await;
    let n = ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    assert_eq!(n, 16);
    assert_eq!(ctx.store.patch_count().unwrap(), 16);
    assert_eq!(ctx.store.feature_count().unwrap(), 32);

    // Re-analysis is a pure cache hit.
    let renders = ctx.blobs.render_count();
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    assert_eq!(ctx.store.patch_count().unwrap(), 16);
    assert_eq!(ctx.blobs.render_count(), renders);
}

#[tokio::test]
async fn test_end_to_end_two_rounds() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();

    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    let seeds = ctx.engine.seed_keyword(kw.id).await.unwrap();
    assert_eq!(seeds.len(), 1);
    let a = ctx.patch_at(8, 8).await;
    assert_eq!(seeds[0].patch_id, a.id);

    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    ctx.engine.initialize(classifier.id).await.unwrap();

    // Seed plus the fallback negative.
    let examples = ctx.store.round_examples(zero.id).await.unwrap();
    assert_eq!(examples.len(), 2);
    let first = ctx.patch_at(0, 0).await;
    assert!(examples.iter().any(|e| e.patch_id == a.id && e.value));
    assert!(examples.iter().any(|e| e.patch_id == first.id && !e.value));

    let predictions = ctx.store.round_predictions(zero.id).await.unwrap();
    assert_eq!(predictions.len(), 14);
    assert!(predictions.iter().all(|p| p.patch_id != a.id && p.patch_id != first.id));

    let queries = ctx.store.round_queries(zero.id).await.unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        ctx.dispatcher.sent(),
        vec![TaskSpec::new(TaskName::PrecropRoundResults, vec![zero.id])]
    );

    // Only the first response counts.
    ctx.store.add_response(queries[0].id, true).await.unwrap();
    ctx.store.add_response(queries[0].id, false).await.unwrap();

    let one = ctx.engine.advance(classifier.id).await.unwrap();
    assert_eq!(one.number, 1);
    let examples = ctx.store.round_examples(one.id).await.unwrap();
    assert_eq!(examples.len(), 3);
    assert!(examples
        .iter()
        .any(|e| e.patch_id == queries[0].patch_id && e.value));
    assert_eq!(ctx.store.round_predictions(one.id).await.unwrap().len(), 13);
    assert_eq!(ctx.store.round_queries(one.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_advance_requires_every_response() {
    let ctx = setup(2).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    ctx.engine.initialize(classifier.id).await.unwrap();

    let queries = ctx.store.round_queries(zero.id).await.unwrap();
    assert_eq!(queries.len(), 2);
    ctx.store.add_response(queries[0].id, false).await.unwrap();

    let err = ctx.engine.advance(classifier.id).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert!(err.is_soft());
    assert_eq!(ctx.store.classifier_rounds(classifier.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_initialize_twice_is_refused() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();

    ctx.engine.initialize(classifier.id).await.unwrap();
    let err = ctx.engine.initialize(classifier.id).await.unwrap_err();
    assert!(err.is_soft());
    assert_eq!(ctx.store.round_examples(zero.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_negative_seed_skips_fallback() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx
        .keyword("reef.png,8,8,8,8,1\nreef.png,16,16,8,8,0\n")
        .await;
    let seeds = ctx.engine.seed_keyword(kw.id).await.unwrap();
    assert_eq!(seeds.len(), 2);

    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    ctx.engine.initialize(classifier.id).await.unwrap();
    let examples = ctx.store.round_examples(zero.id).await.unwrap();
    assert_eq!(examples.len(), 2);
    let first = ctx.patch_at(0, 0).await;
    assert!(examples.iter().all(|e| e.patch_id != first.id));
}

#[tokio::test]
async fn test_seeding_aborts_softly_on_unknown_blob() {
    let ctx = setup(1).await;
    let kw = ctx.keyword("missing.png,0,0,8,8,1\n").await;
    let err = ctx.engine.seed_keyword(kw.id).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
}

#[tokio::test]
async fn test_seeding_aborts_softly_on_empty_dataset() {
    let ctx = setup(1).await;
    let empty = ctx.store.create_dataset("empty", None).await.unwrap();
    let path = ctx.dir.path().join("empty.csv");
    std::fs::write(&path, "reef.png,0,0,8,8,1\n").unwrap();
    let kw = ctx
        .store
        .create_keyword(empty.id, "coral", path.to_str())
        .await
        .unwrap();
    let err = ctx.engine.seed_keyword(kw.id).await.unwrap_err();
    assert!(err.is_soft());
}

#[tokio::test]
async fn test_initialize_without_candidates_aborts_softly() {
    let ctx = setup(1).await;
    // No grid analysis: the seed is the only patch in the dataset.
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, _) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    let err = ctx.engine.initialize(classifier.id).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
}

#[tokio::test]
async fn test_precrop_materializes_queries() {
    let ctx = setup(3).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    ctx.engine.initialize(classifier.id).await.unwrap();

    let before = ctx.blobs.render_count();
    assert_eq!(ctx.engine.precrop_round(zero.id).await.unwrap(), 3);
    assert_eq!(ctx.blobs.render_count(), before + 3);
    assert_eq!(ctx.engine.materialize_seeds(kw.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_detect_scores_dense_grid() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    ctx.engine.initialize(classifier.id).await.unwrap();

    // Without a Dense patch spec there is nothing to detect with.
    let detection = ctx.store.create_detection(ctx.blob.id).await.unwrap();
    let err = ctx.engine.detect(detection.id).await.unwrap_err();
    assert!(err.is_soft());

    ctx.store
        .create_patch_spec(&NewPatchSpec {
            name: defaults::DENSE_PATCH_SPEC.into(),
            width: 16,
            height: 16,
            x_overlap: 0.5,
            y_overlap: 0.5,
            fliplr: false,
        })
        .await
        .unwrap();
    let scored = ctx.engine.detect(detection.id).await.unwrap();
    assert_eq!(scored, 9);
    assert_eq!(ctx.store.patch_count().unwrap(), 16 + 9);

    let window = ctx
        .store
        .ensure_patch(&PatchKey::new(ctx.blob.id, 8, 8, 16, 16))
        .await
        .unwrap();
    let predictions = ctx.store.round_predictions(zero.id).await.unwrap();
    assert!(predictions.iter().any(|p| p.patch_id == window.id));
}

#[tokio::test]
async fn test_initialize_resumes_after_failed_training() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();

    ctx.fail_next_training(1);
    let err = ctx.engine.initialize(classifier.id).await.unwrap_err();
    assert!(matches!(err, Error::Estimator(_)));
    assert!(!err.is_soft());
    assert_eq!(ctx.store.round_examples(zero.id).await.unwrap().len(), 2);
    assert!(ctx.store.round_predictions(zero.id).await.unwrap().is_empty());

    let round = ctx.engine.initialize(classifier.id).await.unwrap();
    assert_eq!(round.id, zero.id);
    assert_eq!(ctx.store.round_examples(zero.id).await.unwrap().len(), 2);
    assert_eq!(ctx.store.round_predictions(zero.id).await.unwrap().len(), 14);
    assert_eq!(ctx.store.round_queries(zero.id).await.unwrap().len(), 1);

    // Once the queries exist, the round is done.
    let err = ctx.engine.initialize(classifier.id).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
}

#[tokio::test]
async fn test_advance_resumes_unpredicted_round() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    ctx.engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();
    ctx.engine.initialize(classifier.id).await.unwrap();
    let queries = ctx.store.round_queries(zero.id).await.unwrap();
    ctx.store.add_response(queries[0].id, true).await.unwrap();

    ctx.fail_next_training(1);
    let err = ctx.engine.advance(classifier.id).await.unwrap_err();
    assert!(matches!(err, Error::Estimator(_)));

    let one = ctx.engine.advance(classifier.id).await.unwrap();
    assert_eq!(one.number, 1);
    let rounds = ctx.store.classifier_rounds(classifier.id).await.unwrap();
    assert_eq!(rounds.iter().map(|r| r.number).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(ctx.store.round_examples(one.id).await.unwrap().len(), 3);
    assert_eq!(ctx.store.round_predictions(one.id).await.unwrap().len(), 13);
    assert_eq!(ctx.store.round_queries(one.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_advance_before_initialize_is_refused() {
    let ctx = setup(1).await;
    ctx.engine.analyze_blob(ctx.dataset.id, ctx.blob.id).await.unwrap();
    let kw = ctx.keyword("reef.png,8,8,8,8,1\n").await;
    let (classifier, _) = ctx.store.create_classifier(kw.id, ctx.dataset.id).await.unwrap();

    let err = ctx.engine.advance(classifier.id).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert_eq!(ctx.store.classifier_rounds(classifier.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_seeding_releases_extractors_after_each_chunk() {
    let ctx = setup(1).await;
    // Off-grid windows, so every row needs fresh extraction.
    let kw = ctx
        .keyword("reef.png,4,4,8,8,1\nreef.png,12,4,8,8,1\nreef.png,20,4,8,8,0\n")
        .await;
    let seeds = ctx.engine.seed_keyword(kw.id).await.unwrap();
    assert_eq!(seeds.len(), 3);

    // One build per chunk of `release_interval` rows.
    assert_eq!(ctx.hist_builds.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.extractors.live_count().await.unwrap(), 0);
}
