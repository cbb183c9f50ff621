//! Two advances racing for the same round over the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use kaizen_core::*;
use kaizen_db::{MemoryBlobStore, MemoryStore};
use kaizen_features::{ExtractorPool, ExtractorRegistry, FeatureCache};
use kaizen_learn::{EngineConfig, LinearSvmFactory, RoundEngine};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Barrier;
use uuid::Uuid;

struct NullDispatcher;

#[async_trait]
impl Dispatch for NullDispatcher {
    async fn dispatch(&self, _spec: TaskSpec) -> Result<Uuid> {
        Ok(Uuid::now_v7())
    }
}

/// Holds every `create_round` until two callers are waiting, so both have
/// read the latest round before either writes.
struct GatedStore {
    inner: MemoryStore,
    gate: Barrier,
}

#[async_trait]
impl DatasetRepository for GatedStore {
    async fn create_dataset(&self, name: &str, patch_spec_id: Option<PatchSpecId>)
        -> Result<Dataset> {
        self.inner.create_dataset(name, patch_spec_id).await
    }
    async fn get_dataset(&self, id: DatasetId) -> Result<Dataset> {
        self.inner.get_dataset(id).await
    }
    async fn create_blob(&self, dataset_id: DatasetId, location: &str) -> Result<Blob> {
        self.inner.create_blob(dataset_id, location).await
    }
    async fn get_blob(&self, id: BlobId) -> Result<Blob> {
        self.inner.get_blob(id).await
    }
    async fn dataset_blobs(&self, dataset_id: DatasetId) -> Result<Vec<Blob>> {
        self.inner.dataset_blobs(dataset_id).await
    }
    async fn create_feature_spec(
        &self,
        dataset_id: DatasetId,
        kind: ExtractorKind,
        params: JsonValue,
    ) -> Result<FeatureSpec> {
        self.inner.create_feature_spec(dataset_id, kind, params).await
    }
    async fn get_feature_spec(&self, id: FeatureSpecId) -> Result<FeatureSpec> {
        self.inner.get_feature_spec(id).await
    }
    async fn dataset_feature_specs(&self, dataset_id: DatasetId) -> Result<Vec<FeatureSpec>> {
        self.inner.dataset_feature_specs(dataset_id).await
    }
}

#[async_trait]
impl PatchRepository for GatedStore {
    async fn ensure_patch(&self, key: &PatchKey) -> Result<Patch> {
        self.inner.ensure_patch(key).await
    }
    async fn get_patch(&self, id: PatchId) -> Result<Patch> {
        self.inner.get_patch(id).await
    }
    async fn blob_patches(&self, blob_id: BlobId) -> Result<Vec<Patch>> {
        self.inner.blob_patches(blob_id).await
    }
    async fn dataset_patches(&self, dataset_id: DatasetId) -> Result<Vec<Patch>> {
        self.inner.dataset_patches(dataset_id).await
    }
    async fn create_patch_spec(&self, spec: &NewPatchSpec) -> Result<PatchSpec> {
        self.inner.create_patch_spec(spec).await
    }
    async fn get_patch_spec(&self, id: PatchSpecId) -> Result<PatchSpec> {
        self.inner.get_patch_spec(id).await
    }
    async fn get_patch_spec_by_name(&self, name: &str) -> Result<PatchSpec> {
        self.inner.get_patch_spec_by_name(name).await
    }
}

#[async_trait]
impl KeywordRepository for GatedStore {
    async fn create_keyword(
        &self,
        dataset_id: DatasetId,
        name: &str,
        definition_file: Option<&str>,
    ) -> Result<Keyword> {
        self.inner.create_keyword(dataset_id, name, definition_file).await
    }
    async fn get_keyword(&self, id: KeywordId) -> Result<Keyword> {
        self.inner.get_keyword(id).await
    }
    async fn dataset_keywords(&self, dataset_id: DatasetId) -> Result<Vec<Keyword>> {
        self.inner.dataset_keywords(dataset_id).await
    }
    async fn add_seed(&self, keyword_id: KeywordId, patch_id: PatchId, value: bool)
        -> Result<Seed> {
        self.inner.add_seed(keyword_id, patch_id, value).await
    }
    async fn keyword_seeds(&self, keyword_id: KeywordId) -> Result<Vec<Seed>> {
        self.inner.keyword_seeds(keyword_id).await
    }
}

#[async_trait]
impl ClassifierRepository for GatedStore {
    async fn create_classifier(
        &self,
        keyword_id: KeywordId,
        dataset_id: DatasetId,
    ) -> Result<(Classifier, Round)> {
        self.inner.create_classifier(keyword_id, dataset_id).await
    }
    async fn get_classifier(&self, id: ClassifierId) -> Result<Classifier> {
        self.inner.get_classifier(id).await
    }
    async fn classifier_for_keyword(&self, keyword_id: KeywordId) -> Result<Option<Classifier>> {
        self.inner.classifier_for_keyword(keyword_id).await
    }
    async fn dataset_classifiers(&self, dataset_id: DatasetId) -> Result<Vec<Classifier>> {
        self.inner.dataset_classifiers(dataset_id).await
    }
}

#[async_trait]
impl RoundRepository for GatedStore {
    async fn get_round(&self, id: RoundId) -> Result<Round> {
        self.inner.get_round(id).await
    }
    async fn latest_round(&self, classifier_id: ClassifierId) -> Result<Round> {
        self.inner.latest_round(classifier_id).await
    }
    async fn classifier_rounds(&self, classifier_id: ClassifierId) -> Result<Vec<Round>> {
        self.inner.classifier_rounds(classifier_id).await
    }
    async fn create_round(
        &self,
        classifier_id: ClassifierId,
        number: i32,
        examples: &[NewExample],
    ) -> Result<Round> {
        self.gate.wait().await;
        self.inner.create_round(classifier_id, number, examples).await
    }
    async fn add_examples(&self, round_id: RoundId, examples: &[NewExample]) -> Result<usize> {
        self.inner.add_examples(round_id, examples).await
    }
    async fn round_examples(&self, round_id: RoundId) -> Result<Vec<Example>> {
        self.inner.round_examples(round_id).await
    }
    async fn add_predictions(&self, round_id: RoundId, predictions: &[NewPrediction])
        -> Result<usize> {
        self.inner.add_predictions(round_id, predictions).await
    }
    async fn round_predictions(&self, round_id: RoundId) -> Result<Vec<Prediction>> {
        self.inner.round_predictions(round_id).await
    }
    async fn add_queries(&self, round_id: RoundId, patch_ids: &[PatchId])
        -> Result<Vec<PendingQuery>> {
        self.inner.add_queries(round_id, patch_ids).await
    }
    async fn round_queries(&self, round_id: RoundId) -> Result<Vec<PendingQuery>> {
        self.inner.round_queries(round_id).await
    }
    async fn add_response(&self, query_id: QueryId, value: bool) -> Result<Response> {
        self.inner.add_response(query_id, value).await
    }
    async fn query_responses(&self, query_id: QueryId) -> Result<Vec<Response>> {
        self.inner.query_responses(query_id).await
    }
}

#[async_trait]
impl FeatureRepository for GatedStore {
    async fn get_feature(&self, patch_id: PatchId, spec_id: FeatureSpecId)
        -> Result<Option<Feature>> {
        self.inner.get_feature(patch_id, spec_id).await
    }
    async fn insert_feature(&self, feature: &Feature) -> Result<bool> {
        self.inner.insert_feature(feature).await
    }
}

#[async_trait]
impl DetectionRepository for GatedStore {
    async fn create_detection(&self, blob_id: BlobId) -> Result<Detection> {
        self.inner.create_detection(blob_id).await
    }
    async fn get_detection(&self, id: DetectionId) -> Result<Detection> {
        self.inner.get_detection(id).await
    }
}

#[tokio::test]
async fn test_concurrent_advance_creates_one_round() {
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
    blobs
        .insert(
            blob.id,
            RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 40])),
        )
        .unwrap();
    store
        .create_feature_spec(dataset.id, ExtractorKind::ColorHist, json!({"bins": 2}))
        .await
        .unwrap();

    let config = KaizenConfig::default().with_query_num(1).with_threshold(0.0);
    let gated = Arc::new(GatedStore {
        inner: store.clone(),
        gate: Barrier::new(2),
    });
    let pool = Arc::new(ExtractorPool::new(ExtractorRegistry::with_defaults(&config)));
    let features = FeatureCache::new(gated.clone(), Arc::new(blobs.clone()), pool);
    let engine = RoundEngine::new(
        gated,
        Arc::new(blobs),
        features,
        Arc::new(LinearSvmFactory::from_config(&config)),
        Arc::new(NullDispatcher),
        EngineConfig::from(&config),
    );

    engine.analyze_blob(dataset.id, blob.id).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coral.csv");
    std::fs::write(&path, "reef.png,8,8,8,8,1\n").unwrap();
    let kw = store
        .create_keyword(dataset.id, "coral", path.to_str())
        .await
        .unwrap();
    engine.seed_keyword(kw.id).await.unwrap();
    let (classifier, zero) = store.create_classifier(kw.id, dataset.id).await.unwrap();
    engine.initialize(classifier.id).await.unwrap();
    for query in store.round_queries(zero.id).await.unwrap() {
        store.add_response(query.id, true).await.unwrap();
    }

    let (a, b) = tokio::join!(engine.advance(classifier.id), engine.advance(classifier.id));
    let (won, lost) = match (a, b) {
        (Ok(round), Err(e)) | (Err(e), Ok(round)) => (round, e),
        other => panic!("expected one winner, got {:?}", other),
    };
    assert_eq!(won.number, 1);
    assert!(matches!(lost, Error::Conflict(_)));
    assert!(lost.is_soft());

    let rounds = store.classifier_rounds(classifier.id).await.unwrap();
    assert_eq!(rounds.iter().map(|r| r.number).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(store.round_queries(won.id).await.unwrap().len(), 1);
}
