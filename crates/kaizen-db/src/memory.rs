//! In-memory store and queue.
//!
//! Implements every repository trait over a single mutex-guarded state so
//! the engine and the worker can run without PostgreSQL (tests, `--memory`
//! CLI mode). Uniqueness rules match the SQL schema: patch keys, seeds per
//! keyword, round numbers per classifier, examples/predictions/queries per
//! round, features per (patch, spec). [`MemoryBlobStore`] renders patches
//! from images held in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, RgbImage};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use kaizen_core::*;

#[derive(Default)]
struct State {
    next_id: i64,
    datasets: BTreeMap<DatasetId, Dataset>,
    blobs: BTreeMap<BlobId, Blob>,
    patches: BTreeMap<PatchId, Patch>,
    patch_index: HashMap<PatchKey, PatchId>,
    patch_specs: BTreeMap<PatchSpecId, PatchSpec>,
    feature_specs: BTreeMap<FeatureSpecId, FeatureSpec>,
    features: HashMap<(PatchId, FeatureSpecId), Feature>,
    keywords: BTreeMap<KeywordId, Keyword>,
    seeds: BTreeMap<SeedId, Seed>,
    classifiers: BTreeMap<ClassifierId, Classifier>,
    rounds: BTreeMap<RoundId, Round>,
    examples: BTreeMap<ExampleId, Example>,
    predictions: BTreeMap<(RoundId, PatchId), Prediction>,
    queries: BTreeMap<QueryId, PendingQuery>,
    responses: BTreeMap<ResponseId, Response>,
    detections: BTreeMap<DetectionId, Detection>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{} {}", what, id))
}

/// Store backed by process memory. Cloning shares the state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    /// Number of cached feature rows (for tests and diagnostics).
    pub fn feature_count(&self) -> Result<usize> {
        Ok(self.state()?.features.len())
    }

    /// Number of patch rows (for tests and diagnostics).
    pub fn patch_count(&self) -> Result<usize> {
        Ok(self.state()?.patches.len())
    }
}

#[async_trait]
impl DatasetRepository for MemoryStore {
    async fn create_dataset(
        &self,
        name: &str,
        patch_spec_id: Option<PatchSpecId>,
    ) -> Result<Dataset> {
        let mut s = self.state()?;
        if let Some(ps) = patch_spec_id {
            if !s.patch_specs.contains_key(&ps) {
                return Err(not_found("patch spec", ps));
            }
        }
        let dataset = Dataset {
            id: s.id(),
            name: name.to_string(),
            patch_spec_id,
        };
        s.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<Dataset> {
        self.state()?
            .datasets
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("dataset", id))
    }

    async fn create_blob(&self, dataset_id: DatasetId, location: &str) -> Result<Blob> {
        let mut s = self.state()?;
        if !s.datasets.contains_key(&dataset_id) {
            return Err(not_found("dataset", dataset_id));
        }
        let blob = Blob {
            id: s.id(),
            dataset_id,
            location: location.to_string(),
        };
        s.blobs.insert(blob.id, blob.clone());
        Ok(blob)
    }

    async fn get_blob(&self, id: BlobId) -> Result<Blob> {
        self.state()?
            .blobs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("blob", id))
    }

    async fn dataset_blobs(&self, dataset_id: DatasetId) -> Result<Vec<Blob>> {
        Ok(self
            .state()?
            .blobs
            .values()
            .filter(|b| b.dataset_id == dataset_id)
            .cloned()
            .collect())
    }

    async fn create_feature_spec(
        &self,
        dataset_id: DatasetId,
        kind: ExtractorKind,
        params: JsonValue,
    ) -> Result<FeatureSpec> {
        let mut s = self.state()?;
        if !s.datasets.contains_key(&dataset_id) {
            return Err(not_found("dataset", dataset_id));
        }
        let spec = FeatureSpec {
            id: s.id(),
            dataset_id,
            kind,
            params,
        };
        s.feature_specs.insert(spec.id, spec.clone());
        Ok(spec)
    }

    async fn get_feature_spec(&self, id: FeatureSpecId) -> Result<FeatureSpec> {
        self.state()?
            .feature_specs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("feature spec", id))
    }

    async fn dataset_feature_specs(&self, dataset_id: DatasetId) -> Result<Vec<FeatureSpec>> {
        Ok(self
            .state()?
            .feature_specs
            .values()
            .filter(|f| f.dataset_id == dataset_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PatchRepository for MemoryStore {
    async fn ensure_patch(&self, key: &PatchKey) -> Result<Patch> {
        let mut s = self.state()?;
        if let Some(id) = s.patch_index.get(key) {
            return Ok(s.patches[id]);
        }
        if !s.blobs.contains_key(&key.blob_id) {
            return Err(not_found("blob", key.blob_id));
        }
        let patch = Patch {
            id: s.id(),
            key: *key,
        };
        s.patches.insert(patch.id, patch);
        s.patch_index.insert(*key, patch.id);
        Ok(patch)
    }

    async fn get_patch(&self, id: PatchId) -> Result<Patch> {
        self.state()?
            .patches
            .get(&id)
            .copied()
            .ok_or_else(|| not_found("patch", id))
    }

    async fn blob_patches(&self, blob_id: BlobId) -> Result<Vec<Patch>> {
        Ok(self
            .state()?
            .patches
            .values()
            .filter(|p| p.key.blob_id == blob_id)
            .copied()
            .collect())
    }

    async fn dataset_patches(&self, dataset_id: DatasetId) -> Result<Vec<Patch>> {
        let s = self.state()?;
        Ok(s.patches
            .values()
            .filter(|p| {
                s.blobs
                    .get(&p.key.blob_id)
                    .is_some_and(|b| b.dataset_id == dataset_id)
            })
            .copied()
            .collect())
    }

    async fn create_patch_spec(&self, spec: &NewPatchSpec) -> Result<PatchSpec> {
        let mut s = self.state()?;
        if s.patch_specs.values().any(|p| p.name == spec.name) {
            return Err(Error::Conflict(format!("patch spec {} exists", spec.name)));
        }
        let created = PatchSpec {
            id: s.id(),
            name: spec.name.clone(),
            width: spec.width,
            height: spec.height,
            x_overlap: spec.x_overlap,
            y_overlap: spec.y_overlap,
            fliplr: spec.fliplr,
        };
        s.patch_specs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_patch_spec(&self, id: PatchSpecId) -> Result<PatchSpec> {
        self.state()?
            .patch_specs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("patch spec", id))
    }

    async fn get_patch_spec_by_name(&self, name: &str) -> Result<PatchSpec> {
        self.state()?
            .patch_specs
            .values()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| not_found("patch spec", name))
    }
}

#[async_trait]
impl KeywordRepository for MemoryStore {
    async fn create_keyword(
        &self,
        dataset_id: DatasetId,
        name: &str,
        definition_file: Option<&str>,
    ) -> Result<Keyword> {
        let mut s = self.state()?;
        if !s.datasets.contains_key(&dataset_id) {
            return Err(not_found("dataset", dataset_id));
        }
        let keyword = Keyword {
            id: s.id(),
            dataset_id,
            name: name.to_string(),
            definition_file: definition_file.map(String::from),
        };
        s.keywords.insert(keyword.id, keyword.clone());
        Ok(keyword)
    }

    async fn get_keyword(&self, id: KeywordId) -> Result<Keyword> {
        self.state()?
            .keywords
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("keyword", id))
    }

    async fn dataset_keywords(&self, dataset_id: DatasetId) -> Result<Vec<Keyword>> {
        Ok(self
            .state()?
            .keywords
            .values()
            .filter(|k| k.dataset_id == dataset_id)
            .cloned()
            .collect())
    }

    async fn add_seed(&self, keyword_id: KeywordId, patch_id: PatchId, value: bool) -> Result<Seed> {
        let mut s = self.state()?;
        if let Some(existing) = s
            .seeds
            .values()
            .find(|seed| seed.keyword_id == keyword_id && seed.patch_id == patch_id)
        {
            return Ok(*existing);
        }
        if !s.keywords.contains_key(&keyword_id) {
            return Err(not_found("keyword", keyword_id));
        }
        if !s.patches.contains_key(&patch_id) {
            return Err(not_found("patch", patch_id));
        }
        let seed = Seed {
            id: s.id(),
            keyword_id,
            patch_id,
            value,
        };
        s.seeds.insert(seed.id, seed);
        Ok(seed)
    }

    async fn keyword_seeds(&self, keyword_id: KeywordId) -> Result<Vec<Seed>> {
        Ok(self
            .state()?
            .seeds
            .values()
            .filter(|seed| seed.keyword_id == keyword_id)
            .copied()
            .collect())
    }
}

#[async_trait]
impl ClassifierRepository for MemoryStore {
    async fn create_classifier(
        &self,
        keyword_id: KeywordId,
        dataset_id: DatasetId,
    ) -> Result<(Classifier, Round)> {
        let mut s = self.state()?;
        if !s.keywords.contains_key(&keyword_id) {
            return Err(not_found("keyword", keyword_id));
        }
        if !s.datasets.contains_key(&dataset_id) {
            return Err(not_found("dataset", dataset_id));
        }
        let classifier = Classifier {
            id: s.id(),
            keyword_id,
            dataset_id,
        };
        let zero = Round {
            id: s.id(),
            classifier_id: classifier.id,
            number: 0,
        };
        s.classifiers.insert(classifier.id, classifier);
        s.rounds.insert(zero.id, zero);
        Ok((classifier, zero))
    }

    async fn get_classifier(&self, id: ClassifierId) -> Result<Classifier> {
        self.state()?
            .classifiers
            .get(&id)
            .copied()
            .ok_or_else(|| not_found("classifier", id))
    }

    async fn classifier_for_keyword(&self, keyword_id: KeywordId) -> Result<Option<Classifier>> {
        Ok(self
            .state()?
            .classifiers
            .values()
            .find(|c| c.keyword_id == keyword_id)
            .copied())
    }

    async fn dataset_classifiers(&self, dataset_id: DatasetId) -> Result<Vec<Classifier>> {
        Ok(self
            .state()?
            .classifiers
            .values()
            .filter(|c| c.dataset_id == dataset_id)
            .copied()
            .collect())
    }
}

fn insert_examples(s: &mut State, round_id: RoundId, examples: &[NewExample]) -> usize {
    let mut added = 0;
    for ex in examples {
        let exists = s
            .examples
            .values()
            .any(|e| e.round_id == round_id && e.patch_id == ex.patch_id);
        if exists {
            continue;
        }
        let example = Example {
            id: s.id(),
            round_id,
            patch_id: ex.patch_id,
            value: ex.value,
        };
        s.examples.insert(example.id, example);
        added += 1;
    }
    added
}

#[async_trait]
impl RoundRepository for MemoryStore {
    async fn get_round(&self, id: RoundId) -> Result<Round> {
        self.state()?
            .rounds
            .get(&id)
            .copied()
            .ok_or_else(|| not_found("round", id))
    }

    async fn latest_round(&self, classifier_id: ClassifierId) -> Result<Round> {
        self.state()?
            .rounds
            .values()
            .filter(|r| r.classifier_id == classifier_id)
            .max_by_key(|r| r.number)
            .copied()
            .ok_or_else(|| not_found("rounds of classifier", classifier_id))
    }

    async fn classifier_rounds(&self, classifier_id: ClassifierId) -> Result<Vec<Round>> {
        let mut rounds: Vec<Round> = self
            .state()?
            .rounds
            .values()
            .filter(|r| r.classifier_id == classifier_id)
            .copied()
            .collect();
        rounds.sort_by_key(|r| r.number);
        Ok(rounds)
    }

    async fn create_round(
        &self,
        classifier_id: ClassifierId,
        number: i32,
        examples: &[NewExample],
    ) -> Result<Round> {
        let mut s = self.state()?;
        if !s.classifiers.contains_key(&classifier_id) {
            return Err(not_found("classifier", classifier_id));
        }
        if s
            .rounds
            .values()
            .any(|r| r.classifier_id == classifier_id && r.number == number)
        {
            return Err(Error::Conflict(format!(
                "round {} of classifier {} exists",
                number, classifier_id
            )));
        }
        let round = Round {
            id: s.id(),
            classifier_id,
            number,
        };
        s.rounds.insert(round.id, round);
        insert_examples(&mut s, round.id, examples);
        Ok(round)
    }

    async fn add_examples(&self, round_id: RoundId, examples: &[NewExample]) -> Result<usize> {
        let mut s = self.state()?;
        if !s.rounds.contains_key(&round_id) {
            return Err(not_found("round", round_id));
        }
        Ok(insert_examples(&mut s, round_id, examples))
    }

    async fn round_examples(&self, round_id: RoundId) -> Result<Vec<Example>> {
        Ok(self
            .state()?
            .examples
            .values()
            .filter(|e| e.round_id == round_id)
            .copied()
            .collect())
    }

    async fn add_predictions(
        &self,
        round_id: RoundId,
        predictions: &[NewPrediction],
    ) -> Result<usize> {
        let mut s = self.state()?;
        if !s.rounds.contains_key(&round_id) {
            return Err(not_found("round", round_id));
        }
        for p in predictions {
            let existing = s.predictions.get(&(round_id, p.patch_id)).map(|e| e.id);
            let id = match existing {
                Some(id) => id,
                None => s.id(),
            };
            s.predictions.insert(
                (round_id, p.patch_id),
                Prediction {
                    id,
                    round_id,
                    patch_id: p.patch_id,
                    score: p.score,
                },
            );
        }
        Ok(predictions.len())
    }

    async fn round_predictions(&self, round_id: RoundId) -> Result<Vec<Prediction>> {
        Ok(self
            .state()?
            .predictions
            .range((round_id, PatchId::MIN)..=(round_id, PatchId::MAX))
            .map(|(_, p)| *p)
            .collect())
    }

    async fn add_queries(
        &self,
        round_id: RoundId,
        patch_ids: &[PatchId],
    ) -> Result<Vec<PendingQuery>> {
        let mut s = self.state()?;
        if !s.rounds.contains_key(&round_id) {
            return Err(not_found("round", round_id));
        }
        let mut created = Vec::with_capacity(patch_ids.len());
        for &patch_id in patch_ids {
            let exists = s
                .queries
                .values()
                .any(|q| q.round_id == round_id && q.patch_id == patch_id);
            if exists {
                continue;
            }
            let query = PendingQuery {
                id: s.id(),
                round_id,
                patch_id,
            };
            s.queries.insert(query.id, query);
            created.push(query);
        }
        Ok(created)
    }

    async fn round_queries(&self, round_id: RoundId) -> Result<Vec<PendingQuery>> {
        Ok(self
            .state()?
            .queries
            .values()
            .filter(|q| q.round_id == round_id)
            .copied()
            .collect())
    }

    async fn add_response(&self, query_id: QueryId, value: bool) -> Result<Response> {
        let mut s = self.state()?;
        if !s.queries.contains_key(&query_id) {
            return Err(not_found("query", query_id));
        }
        let response = Response {
            id: s.id(),
            query_id,
            value,
        };
        s.responses.insert(response.id, response);
        Ok(response)
    }

    async fn query_responses(&self, query_id: QueryId) -> Result<Vec<Response>> {
        Ok(self
            .state()?
            .responses
            .values()
            .filter(|r| r.query_id == query_id)
            .copied()
            .collect())
    }
}

#[async_trait]
impl FeatureRepository for MemoryStore {
    async fn get_feature(
        &self,
        patch_id: PatchId,
        spec_id: FeatureSpecId,
    ) -> Result<Option<Feature>> {
        Ok(self.state()?.features.get(&(patch_id, spec_id)).cloned())
    }

    async fn insert_feature(&self, feature: &Feature) -> Result<bool> {
        let mut s = self.state()?;
        let key = (feature.patch_id, feature.spec_id);
        if s.features.contains_key(&key) {
            return Ok(false);
        }
        s.features.insert(key, feature.clone());
        Ok(true)
    }
}

#[async_trait]
impl DetectionRepository for MemoryStore {
    async fn create_detection(&self, blob_id: BlobId) -> Result<Detection> {
        let mut s = self.state()?;
        if !s.blobs.contains_key(&blob_id) {
            return Err(not_found("blob", blob_id));
        }
        let detection = Detection {
            id: s.id(),
            blob_id,
        };
        s.detections.insert(detection.id, detection);
        Ok(detection)
    }

    async fn get_detection(&self, id: DetectionId) -> Result<Detection> {
        self.state()?
            .detections
            .get(&id)
            .copied()
            .ok_or_else(|| not_found("detection", id))
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Default)]
struct QueueState {
    /// Jobs in enqueue order.
    jobs: Vec<Job>,
    barriers: HashMap<Uuid, (usize, Continuation)>,
}

impl QueueState {
    fn push(&mut self, spec: &TaskSpec, barrier_id: Option<Uuid>) -> Uuid {
        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            spec: spec.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            barrier_id,
            not_before: now,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        let id = job.id;
        self.jobs.push(job);
        id
    }

    fn enqueue_stages(&mut self, stages: &[Vec<TaskSpec>]) -> Option<Uuid> {
        let (stage, rest) = next_stage(stages)?;
        let barrier = if rest.is_empty() {
            None
        } else {
            let id = Uuid::now_v7();
            self.barriers.insert(id, (stage.len(), rest));
            Some(id)
        };
        for spec in stage {
            self.push(spec, barrier);
        }
        barrier
    }

    /// Apply `settle` to an unfinished job, then record its arrival.
    fn finish<F>(&mut self, job_id: Uuid, settle: F) -> Result<Option<Uuid>>
    where
        F: FnOnce(&mut Job),
    {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| not_found("job", job_id))?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return Ok(None);
        }
        settle(job);
        let Some(barrier_id) = job.barrier_id else {
            return Ok(None);
        };

        let (remaining, continuation) = self
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| not_found("barrier", barrier_id))?;
        if *remaining == 0 {
            return Ok(None);
        }
        *remaining -= 1;
        if *remaining > 0 {
            return Ok(None);
        }
        let rest = std::mem::take(continuation);
        self.enqueue_stages(&rest);
        Ok(Some(barrier_id))
    }
}

/// Job queue backed by process memory. Cloning shares the queue.
#[derive(Clone, Default)]
pub struct MemoryJobRepository {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory queue lock poisoned".into()))
    }

    fn with_job<F>(&self, job_id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut s = self.state()?;
        let job = s
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| not_found("job", job_id))?;
        f(job);
        Ok(())
    }

    /// Snapshot of every job, in enqueue order.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.state()?.jobs.clone())
    }

    /// Task specs of jobs still pending, in enqueue order.
    pub fn pending_specs(&self) -> Result<Vec<TaskSpec>> {
        Ok(self
            .state()?
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.spec.clone())
            .collect())
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(&self, spec: &TaskSpec, barrier_id: Option<Uuid>) -> Result<Uuid> {
        Ok(self.state()?.push(spec, barrier_id))
    }

    async fn enqueue_stages(&self, stages: &Continuation) -> Result<Option<Uuid>> {
        Ok(self.state()?.enqueue_stages(stages))
    }

    async fn claim_next(&self, tasks: &[TaskName]) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut s = self.state()?;
        let next = s.jobs.iter_mut().find(|j| {
            j.status == JobStatus::Pending
                && j.not_before <= now
                && (tasks.is_empty() || tasks.contains(&j.spec.task))
        });
        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.clone()
        }))
    }

    async fn complete(&self, job_id: Uuid) -> Result<Option<Uuid>> {
        self.state()?.finish(job_id, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        })
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.with_job(job_id, |job| {
            job.status = JobStatus::Pending;
            job.attempts += 1;
            job.not_before = not_before;
            job.last_error = Some(error.to_string());
            job.started_at = None;
        })
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<Option<Uuid>> {
        self.state()?.finish(job_id, |job| {
            job.status = JobStatus::Failed;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.completed_at = Some(Utc::now());
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .state()?
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(self
            .state()?
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count() as i64)
    }
}

// =============================================================================
// BLOBS
// =============================================================================

/// Blob store over images registered in memory, keyed by blob id.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    images: Arc<Mutex<HashMap<BlobId, Arc<DynamicImage>>>>,
    renders: Arc<Mutex<usize>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the pixels of a blob.
    pub fn insert(&self, blob_id: BlobId, image: RgbImage) -> Result<()> {
        self.images
            .lock()
            .map_err(|_| Error::Internal("memory blob lock poisoned".into()))?
            .insert(blob_id, Arc::new(DynamicImage::ImageRgb8(image)));
        Ok(())
    }

    /// Number of patches rendered so far.
    pub fn render_count(&self) -> usize {
        self.renders.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn materialize(&self, blob: &Blob, patch: &Patch) -> Result<Vec<u8>> {
        let image = self
            .images
            .lock()
            .map_err(|_| Error::Internal("memory blob lock poisoned".into()))?
            .get(&blob.id)
            .cloned()
            .ok_or_else(|| not_found("blob image", blob.id))?;
        let bytes = crate::file_storage::encode_png(&crate::file_storage::render_patch(
            &image, &patch.key,
        )?)?;
        if let Ok(mut n) = self.renders.lock() {
            *n += 1;
        }
        Ok(bytes)
    }

    async fn dimensions(&self, blob: &Blob) -> Result<(u32, u32)> {
        self.images
            .lock()
            .map_err(|_| Error::Internal("memory blob lock poisoned".into()))?
            .get(&blob.id)
            .map(|image| (image.width(), image.height()))
            .ok_or_else(|| not_found("blob image", blob.id))
    }
}
