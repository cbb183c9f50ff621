//! Core traits for kaizen abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability. The round
//! engine and the orchestrator depend only on these.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// STORE
// =============================================================================

/// Datasets, their blobs and their feature specs.
#[async_trait]
pub trait DatasetRepository: Send + Sync {
    /// Create a dataset.
    async fn create_dataset(&self, name: &str, patch_spec_id: Option<PatchSpecId>)
        -> Result<Dataset>;

    /// Fetch a dataset by id.
    async fn get_dataset(&self, id: DatasetId) -> Result<Dataset>;

    /// Register a source image with a dataset.
    async fn create_blob(&self, dataset_id: DatasetId, location: &str) -> Result<Blob>;

    /// Fetch a blob by id.
    async fn get_blob(&self, id: BlobId) -> Result<Blob>;

    /// Blobs of a dataset, ordered by id.
    async fn dataset_blobs(&self, dataset_id: DatasetId) -> Result<Vec<Blob>>;

    /// Attach a feature spec to a dataset.
    async fn create_feature_spec(
        &self,
        dataset_id: DatasetId,
        kind: ExtractorKind,
        params: JsonValue,
    ) -> Result<FeatureSpec>;

    /// Fetch a feature spec by id.
    async fn get_feature_spec(&self, id: FeatureSpecId) -> Result<FeatureSpec>;

    /// Feature specs of a dataset, ordered by id.
    async fn dataset_feature_specs(&self, dataset_id: DatasetId) -> Result<Vec<FeatureSpec>>;
}

/// Patches and patch specs.
#[async_trait]
pub trait PatchRepository: Send + Sync {
    /// Return the patch with this key, creating it if absent.
    ///
    /// Concurrent calls with equal keys must converge on one row.
    async fn ensure_patch(&self, key: &PatchKey) -> Result<Patch>;

    /// Fetch a patch by id.
    async fn get_patch(&self, id: PatchId) -> Result<Patch>;

    /// Patches of a blob, ordered by id.
    async fn blob_patches(&self, blob_id: BlobId) -> Result<Vec<Patch>>;

    /// Patches of every blob of a dataset, ordered by id.
    async fn dataset_patches(&self, dataset_id: DatasetId) -> Result<Vec<Patch>>;

    /// Create a patch spec.
    async fn create_patch_spec(&self, spec: &NewPatchSpec) -> Result<PatchSpec>;

    /// Fetch a patch spec by id.
    async fn get_patch_spec(&self, id: PatchSpecId) -> Result<PatchSpec>;

    /// Fetch a patch spec by its unique name.
    async fn get_patch_spec_by_name(&self, name: &str) -> Result<PatchSpec>;
}

/// Keywords and their seeds.
#[async_trait]
pub trait KeywordRepository: Send + Sync {
    /// Create a keyword.
    async fn create_keyword(
        &self,
        dataset_id: DatasetId,
        name: &str,
        definition_file: Option<&str>,
    ) -> Result<Keyword>;

    /// Fetch a keyword by id.
    async fn get_keyword(&self, id: KeywordId) -> Result<Keyword>;

    /// Keywords of a dataset, ordered by id.
    async fn dataset_keywords(&self, dataset_id: DatasetId) -> Result<Vec<Keyword>>;

    /// Record a seed. Re-adding the same patch returns the existing seed.
    async fn add_seed(&self, keyword_id: KeywordId, patch_id: PatchId, value: bool)
        -> Result<Seed>;

    /// Seeds of a keyword, ordered by id.
    async fn keyword_seeds(&self, keyword_id: KeywordId) -> Result<Vec<Seed>>;
}

/// Classifiers.
#[async_trait]
pub trait ClassifierRepository: Send + Sync {
    /// Create a classifier together with its (empty) round 0.
    async fn create_classifier(
        &self,
        keyword_id: KeywordId,
        dataset_id: DatasetId,
    ) -> Result<(Classifier, Round)>;

    /// Fetch a classifier by id.
    async fn get_classifier(&self, id: ClassifierId) -> Result<Classifier>;

    /// The classifier bound to a keyword, if any (lowest id wins).
    async fn classifier_for_keyword(&self, keyword_id: KeywordId) -> Result<Option<Classifier>>;

    /// Classifiers of a dataset, ordered by id.
    async fn dataset_classifiers(&self, dataset_id: DatasetId) -> Result<Vec<Classifier>>;
}

/// Rounds and everything they own.
#[async_trait]
pub trait RoundRepository: Send + Sync {
    /// Fetch a round by id.
    async fn get_round(&self, id: RoundId) -> Result<Round>;

    /// Highest-numbered round of a classifier.
    async fn latest_round(&self, classifier_id: ClassifierId) -> Result<Round>;

    /// Rounds of a classifier, ordered by number.
    async fn classifier_rounds(&self, classifier_id: ClassifierId) -> Result<Vec<Round>>;

    /// Atomically create a round and its initial examples.
    ///
    /// Fails with `Error::Conflict` if the classifier already has a round
    /// with this number.
    async fn create_round(
        &self,
        classifier_id: ClassifierId,
        number: i32,
        examples: &[NewExample],
    ) -> Result<Round>;

    /// Add examples to a round. A patch already in the round is skipped.
    async fn add_examples(&self, round_id: RoundId, examples: &[NewExample]) -> Result<usize>;

    /// Examples of a round, ordered by id.
    async fn round_examples(&self, round_id: RoundId) -> Result<Vec<Example>>;

    /// Persist predictions, replacing any earlier score for the same patch.
    async fn add_predictions(&self, round_id: RoundId, predictions: &[NewPrediction])
        -> Result<usize>;

    /// Predictions of a round, ordered by patch id.
    async fn round_predictions(&self, round_id: RoundId) -> Result<Vec<Prediction>>;

    /// Create one pending query per patch, in order. A patch already queried
    /// in the round is skipped.
    async fn add_queries(&self, round_id: RoundId, patch_ids: &[PatchId])
        -> Result<Vec<PendingQuery>>;

    /// Pending queries of a round, ordered by id.
    async fn round_queries(&self, round_id: RoundId) -> Result<Vec<PendingQuery>>;

    /// Record a human response.
    async fn add_response(&self, query_id: QueryId, value: bool) -> Result<Response>;

    /// Responses to a query, in persistence order.
    async fn query_responses(&self, query_id: QueryId) -> Result<Vec<Response>>;
}

/// Append-only feature cache.
#[async_trait]
pub trait FeatureRepository: Send + Sync {
    /// Cached vector for a (patch, spec) pair.
    async fn get_feature(&self, patch_id: PatchId, spec_id: FeatureSpecId)
        -> Result<Option<Feature>>;

    /// Insert unless a row for the pair already exists. Returns whether a row
    /// was written; an existing row is never overwritten.
    async fn insert_feature(&self, feature: &Feature) -> Result<bool>;
}

/// Detection requests.
#[async_trait]
pub trait DetectionRepository: Send + Sync {
    /// Request detection over a blob.
    async fn create_detection(&self, blob_id: BlobId) -> Result<Detection>;

    /// Fetch a detection by id.
    async fn get_detection(&self, id: DetectionId) -> Result<Detection>;
}

/// Everything the engine reads and writes.
pub trait Store:
    DatasetRepository
    + PatchRepository
    + KeywordRepository
    + ClassifierRepository
    + RoundRepository
    + FeatureRepository
    + DetectionRepository
{
}

impl<T> Store for T where
    T: DatasetRepository
        + PatchRepository
        + KeywordRepository
        + ClassifierRepository
        + RoundRepository
        + FeatureRepository
        + DetectionRepository
{
}

// =============================================================================
// QUEUE
// =============================================================================

/// Durable task queue with at-least-once delivery.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a task, optionally reporting to a barrier.
    async fn enqueue(&self, spec: &TaskSpec, barrier_id: Option<Uuid>) -> Result<Uuid>;

    /// Claim the oldest pending job of one of the given tasks whose
    /// `not_before` has passed. Empty slice = any task.
    async fn claim_next(&self, tasks: &[TaskName]) -> Result<Option<Job>>;

    /// Queue the first non-empty stage in one transaction. When non-empty
    /// stages follow it, its jobs report to a new barrier carrying them,
    /// which is returned.
    async fn enqueue_stages(&self, stages: &Continuation) -> Result<Option<Uuid>>;

    /// Mark a job completed and record its arrival at its barrier in the
    /// same transaction. The arrival that opens the barrier also queues the
    /// continuation's next stage there; that barrier's id is returned.
    /// Settling a job that already finished is a no-op.
    async fn complete(&self, job_id: Uuid) -> Result<Option<Uuid>>;

    /// Return a failed job to pending with one more attempt recorded.
    async fn reschedule(&self, job_id: Uuid, not_before: DateTime<Utc>, error: &str)
        -> Result<()>;

    /// Mark a job permanently failed. A failed job still arrives at its
    /// barrier, exactly as in [`JobRepository::complete`].
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<Option<Uuid>>;

    /// Fetch a job by id.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Jobs waiting to run.
    async fn pending_count(&self) -> Result<i64>;
}

/// Something that can schedule follow-up work.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Queue one task for eventual execution.
    async fn dispatch(&self, spec: TaskSpec) -> Result<Uuid>;

    /// Queue a task for `id` only if there is one. Absence is not an error.
    async fn dispatch_if(&self, task: TaskName, id: Option<i64>) -> Result<Option<Uuid>> {
        match id {
            Some(id) => self.dispatch(TaskSpec::new(task, vec![id])).await.map(Some),
            None => Ok(None),
        }
    }
}

// =============================================================================
// BLOB STORE
// =============================================================================

/// Renders patch pixels from source images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Encoded image bytes of the patch, cached by blob id and geometry.
    async fn materialize(&self, blob: &Blob, patch: &Patch) -> Result<Vec<u8>>;

    /// Width and height of the source image, in pixels.
    async fn dimensions(&self, blob: &Blob) -> Result<(u32, u32)>;
}
