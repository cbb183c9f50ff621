//! The active-learning round engine.
//!
//! Each classifier moves through numbered rounds: round 0 is built from the
//! keyword's seeds, every later round is the previous round's examples plus
//! one example per answered query. Within a round the engine trains an
//! estimator, scores every other candidate patch and asks about the ones it
//! is least certain of.
//!
//! Every method reads what it needs at entry, writes through the store and
//! only dispatches follow-up work after the writes it depends on returned.
//! Missing prerequisites surface as `Error::Precondition`, lost races as
//! `Error::Conflict`; both are soft and callers log them instead of retrying.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array2;
use tracing::{debug, info, warn};

use kaizen_core::{
    defaults, Blob, BlobId, BlobStore, Classifier, ClassifierId, DatasetId, DetectionId, Dispatch,
    Error, Example, FeatureSpec, KaizenConfig, KeywordId, NewExample, NewPrediction, Patch, PatchId,
    PatchKey, PatchSpec, PendingQuery, Result, Round, RoundId, Seed, Store, TaskName, TaskSpec,
};
use kaizen_features::FeatureCache;

use crate::estimator::{Estimator, EstimatorFactory};
use crate::grid::dense_grid;
use crate::seeds::{find_blob, parse_definition};
use crate::selector::select_uncertain;

/// Tunables of the round engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queries chosen per round.
    pub query_num: usize,
    /// Seed rows between extractor releases.
    pub release_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_num: defaults::QUERY_NUM,
            release_interval: defaults::RELEASE_INTERVAL,
        }
    }
}

impl From<&KaizenConfig> for EngineConfig {
    fn from(config: &KaizenConfig) -> Self {
        Self {
            query_num: config.query_num,
            release_interval: config.release_interval.max(1),
        }
    }
}

/// Drives classifiers through their rounds.
#[derive(Clone)]
pub struct RoundEngine {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    features: FeatureCache,
    estimators: Arc<dyn EstimatorFactory>,
    dispatcher: Arc<dyn Dispatch>,
    config: EngineConfig,
}

impl RoundEngine {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        features: FeatureCache,
        estimators: Arc<dyn EstimatorFactory>,
        dispatcher: Arc<dyn Dispatch>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            features,
            estimators,
            dispatcher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatch> {
        &self.dispatcher
    }

    // =========================================================================
    // ROUNDS
    // =========================================================================

    /// Fill round 0 from the keyword's seeds and run its first prediction.
    ///
    /// When no seed is negative, the first dataset patch that is not a seed
    /// (blobs in id order, patches in id order) is added as a negative so the
    /// estimator sees both classes.
    pub async fn initialize(&self, classifier_id: ClassifierId) -> Result<Round> {
        let start = Instant::now();
        let classifier = self.store.get_classifier(classifier_id).await?;
        let zero = self
            .store
            .classifier_rounds(classifier_id)
            .await?
            .into_iter()
            .find(|r| r.number == 0)
            .ok_or_else(|| Error::NotFound(format!("round 0 of classifier {}", classifier_id)))?;

        if !self.store.round_examples(zero.id).await?.is_empty() {
            if self.resume(&zero).await? {
                return Ok(zero);
            }
            return Err(Error::Precondition(format!(
                "classifier {} is already initialized",
                classifier_id
            )));
        }

        let seeds = self.store.keyword_seeds(classifier.keyword_id).await?;
        let mut patches = Vec::with_capacity(seeds.len() + 1);
        for seed in &seeds {
            patches.push(self.store.get_patch(seed.patch_id).await?);
        }
        let mut examples: Vec<NewExample> = seeds
            .iter()
            .map(|s| NewExample {
                patch_id: s.patch_id,
                value: s.value,
            })
            .collect();

        if !seeds.iter().any(|s| !s.value) {
            let seeded: HashSet<PatchId> = seeds.iter().map(|s| s.patch_id).collect();
            let negative = self
                .first_unseeded_patch(classifier.dataset_id, &seeded)
                .await?
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "dataset {} has no patch to use as a negative example",
                        classifier.dataset_id
                    ))
                })?;
            debug!(
                subsystem = "learn",
                component = "round_engine",
                op = "initialize",
                classifier_id,
                patch_id = negative.id,
                "No negative seed, using fallback negative"
            );
            examples.push(NewExample {
                patch_id: negative.id,
                value: false,
            });
            patches.push(negative);
        }

        let specs = self.store.dataset_feature_specs(classifier.dataset_id).await?;
        self.features.analyze(&patches, &specs).await?;
        let added = self.store.add_examples(zero.id, &examples).await?;

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "initialize",
            classifier_id,
            round_id = zero.id,
            example_count = added,
            duration_ms = start.elapsed().as_millis() as u64,
            "Round 0 initialized"
        );
        self.predict(zero.id).await?;
        Ok(zero)
    }

    /// Train on a round's examples, score every other candidate of the
    /// dataset, then choose the round's queries.
    pub async fn predict(&self, round_id: RoundId) -> Result<Vec<PendingQuery>> {
        let start = Instant::now();
        let round = self.store.get_round(round_id).await?;
        let classifier = self.store.get_classifier(round.classifier_id).await?;
        let specs = self.store.dataset_feature_specs(classifier.dataset_id).await?;

        let examples = self.store.round_examples(round_id).await?;
        let estimator = self.train(&round, &examples, &specs).await?;

        let examples: HashSet<PatchId> = examples.into_iter().map(|e| e.patch_id).collect();
        let candidates: Vec<Patch> = self
            .store
            .dataset_patches(classifier.dataset_id)
            .await?
            .into_iter()
            .filter(|p| !examples.contains(&p.id))
            .collect();

        let scored = self.score(estimator.as_ref(), &candidates, &specs).await?;
        let written = self.store.add_predictions(round_id, &scored).await?;

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "predict",
            classifier_id = classifier.id,
            round_id,
            round = round.number,
            prediction_count = written,
            duration_ms = start.elapsed().as_millis() as u64,
            "Round predicted"
        );
        self.choose_queries(round_id).await
    }

    /// Persist the round's most uncertain predictions as pending queries and
    /// schedule their patches for materialization.
    pub async fn choose_queries(&self, round_id: RoundId) -> Result<Vec<PendingQuery>> {
        let predictions = self.store.round_predictions(round_id).await?;
        let chosen = select_uncertain(
            &predictions,
            self.estimators.threshold(),
            self.config.query_num,
        );
        let queries = self.store.add_queries(round_id, &chosen).await?;

        self.dispatcher
            .dispatch(TaskSpec::new(TaskName::PrecropRoundResults, vec![round_id]))
            .await?;

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "choose_queries",
            round_id,
            query_count = queries.len(),
            "Queries chosen"
        );
        Ok(queries)
    }

    /// Open the next round from the answers to the latest one.
    ///
    /// Every pending query needs at least one response; the lowest-id
    /// response is the ground truth. If another advance created the round
    /// first, this one fails with `Error::Conflict`. A latest round without
    /// queries was created by an advance that failed before choosing them;
    /// it is finished and returned instead of opening another.
    pub async fn advance(&self, classifier_id: ClassifierId) -> Result<Round> {
        let start = Instant::now();
        let latest = self.store.latest_round(classifier_id).await?;
        let queries = self.store.round_queries(latest.id).await?;

        if queries.is_empty() {
            if latest.number == 0 {
                return Err(Error::Precondition(format!(
                    "classifier {} is not initialized",
                    classifier_id
                )));
            }
            self.resume(&latest).await?;
            return Ok(latest);
        }

        let mut examples: Vec<NewExample> = self
            .store
            .round_examples(latest.id)
            .await?
            .into_iter()
            .map(|e| NewExample {
                patch_id: e.patch_id,
                value: e.value,
            })
            .collect();

        for query in &queries {
            let first = self
                .store
                .query_responses(query.id)
                .await?
                .into_iter()
                .min_by_key(|r| r.id)
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "query {} of round {} has no response",
                        query.id, latest.id
                    ))
                })?;
            examples.push(NewExample {
                patch_id: query.patch_id,
                value: first.value,
            });
        }

        let next = self
            .store
            .create_round(classifier_id, latest.number + 1, &examples)
            .await?;

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "advance",
            classifier_id,
            round_id = next.id,
            round = next.number,
            example_count = examples.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Round advanced"
        );
        self.predict(next.id).await?;
        Ok(next)
    }

    /// Finish a round whose examples exist but whose predict step did not
    /// complete. Returns `false` when the round already has its queries.
    async fn resume(&self, round: &Round) -> Result<bool> {
        if self.store.round_predictions(round.id).await?.is_empty() {
            self.predict(round.id).await?;
        } else if self.store.round_queries(round.id).await?.is_empty() {
            self.choose_queries(round.id).await?;
        } else {
            return Ok(false);
        }
        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "resume",
            classifier_id = round.classifier_id,
            round_id = round.id,
            round = round.number,
            "Unfinished round resumed"
        );
        Ok(true)
    }

    // =========================================================================
    // DETECTION
    // =========================================================================

    /// Run a detection request with the `Dense` patch spec.
    pub async fn detect(&self, detection_id: DetectionId) -> Result<usize> {
        let detection = self.store.get_detection(detection_id).await?;
        let blob = self.store.get_blob(detection.blob_id).await?;
        let dense = match self
            .store
            .get_patch_spec_by_name(defaults::DENSE_PATCH_SPEC)
            .await
        {
            Ok(spec) => spec,
            Err(Error::NotFound(_)) => {
                return Err(Error::Precondition(format!(
                    "patch spec '{}' does not exist",
                    defaults::DENSE_PATCH_SPEC
                )))
            }
            Err(e) => return Err(e),
        };
        self.detect_batch(&blob, &dense).await
    }

    /// Score a dense grid over `blob` with every classifier of its dataset,
    /// writing predictions into each classifier's latest round.
    pub async fn detect_batch(&self, blob: &Blob, patch_spec: &PatchSpec) -> Result<usize> {
        let start = Instant::now();
        let grid = self.ensure_grid(blob, patch_spec).await?;
        let classifiers = self.store.dataset_classifiers(blob.dataset_id).await?;
        let specs = self.store.dataset_feature_specs(blob.dataset_id).await?;

        let mut total = 0;
        for classifier in &classifiers {
            total += self.detect_with(classifier, &grid, &specs).await?;
        }

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "detect",
            blob_id = blob.id,
            classifiers = classifiers.len(),
            patches = grid.len(),
            prediction_count = total,
            duration_ms = start.elapsed().as_millis() as u64,
            "Detection complete"
        );
        Ok(total)
    }

    async fn detect_with(
        &self,
        classifier: &Classifier,
        grid: &[Patch],
        specs: &[FeatureSpec],
    ) -> Result<usize> {
        let latest = self.store.latest_round(classifier.id).await?;
        let examples = self.store.round_examples(latest.id).await?;
        let estimator = match self.train(&latest, &examples, specs).await {
            Ok(estimator) => estimator,
            Err(e) if e.is_soft() => {
                warn!(
                    subsystem = "learn",
                    component = "round_engine",
                    op = "detect",
                    classifier_id = classifier.id,
                    error = %e,
                    "Skipping classifier"
                );
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let scored = self.score(estimator.as_ref(), grid, specs).await?;
        self.store.add_predictions(latest.id, &scored).await
    }

    // =========================================================================
    // DATASET PREPARATION
    // =========================================================================

    /// Compute features for every patch of a blob under every feature spec.
    ///
    /// If the dataset has a patch spec, its grid over the blob is ensured
    /// first.
    pub async fn analyze_blob(&self, dataset_id: DatasetId, blob_id: BlobId) -> Result<usize> {
        let start = Instant::now();
        let dataset = self.store.get_dataset(dataset_id).await?;
        let blob = self.store.get_blob(blob_id).await?;
        if blob.dataset_id != dataset_id {
            return Err(Error::InvalidInput(format!(
                "blob {} does not belong to dataset {}",
                blob_id, dataset_id
            )));
        }
        if let Some(spec_id) = dataset.patch_spec_id {
            let spec = self.store.get_patch_spec(spec_id).await?;
            self.ensure_grid(&blob, &spec).await?;
        }

        let patches = self.store.blob_patches(blob_id).await?;
        let specs = self.store.dataset_feature_specs(dataset_id).await?;
        self.features.analyze(&patches, &specs).await?;

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "analyze_blob",
            dataset_id,
            blob_id,
            patches = patches.len(),
            specs = specs.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Blob analyzed"
        );
        Ok(patches.len())
    }

    /// Load a keyword's definition file into seeds, computing their features.
    ///
    /// Rows are processed in chunks of `release_interval`; extractors are
    /// released after each chunk. A row naming an unknown blob, or a dataset
    /// without blobs, aborts the keyword.
    pub async fn seed_keyword(&self, keyword_id: KeywordId) -> Result<Vec<Seed>> {
        let start = Instant::now();
        let keyword = self.store.get_keyword(keyword_id).await?;
        let Some(path) = keyword.definition_file.as_deref() else {
            debug!(
                subsystem = "learn",
                component = "round_engine",
                op = "seed_keyword",
                keyword_id,
                "Keyword has no definition file"
            );
            return self.store.keyword_seeds(keyword_id).await;
        };

        let text = tokio::fs::read_to_string(path).await?;
        let rows = parse_definition(&text)?;
        let blobs = self.store.dataset_blobs(keyword.dataset_id).await?;
        if blobs.is_empty() {
            return Err(Error::Precondition(format!(
                "cannot seed keyword {} from empty dataset {}",
                keyword_id, keyword.dataset_id
            )));
        }
        let specs = self.store.dataset_feature_specs(keyword.dataset_id).await?;

        let mut seeds = Vec::with_capacity(rows.len());
        for (n, chunk) in rows.chunks(self.config.release_interval.max(1)).enumerate() {
            let mut patches = Vec::with_capacity(chunk.len());
            for row in chunk.iter() {
                let blob = find_blob(&blobs, &row.blob_name).ok_or_else(|| {
                    Error::Precondition(format!(
                        "no blob named '{}' in dataset {}",
                        row.blob_name, keyword.dataset_id
                    ))
                })?;
                let key = PatchKey::new(blob.id, row.x, row.y, row.width, row.height);
                patches.push(self.store.ensure_patch(&key).await?);
            }

            self.features.analyze(&patches, &specs).await?;
            for (patch, row) in patches.iter().zip(chunk.iter()) {
                seeds.push(self.store.add_seed(keyword_id, patch.id, row.value).await?);
            }

            let released = self.features.release().await?;
            debug!(
                subsystem = "learn",
                component = "round_engine",
                op = "seed_keyword",
                keyword_id,
                chunk = n,
                released,
                "Extractors released"
            );
        }

        info!(
            subsystem = "learn",
            component = "round_engine",
            op = "seed_keyword",
            keyword_id,
            seeds = seeds.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Keyword seeded"
        );
        Ok(seeds)
    }

    /// Render the patches of a keyword's seeds into the blob store cache.
    pub async fn materialize_seeds(&self, keyword_id: KeywordId) -> Result<usize> {
        let seeds = self.store.keyword_seeds(keyword_id).await?;
        let mut patches = Vec::with_capacity(seeds.len());
        for seed in &seeds {
            patches.push(self.store.get_patch(seed.patch_id).await?);
        }
        self.materialize(&patches).await
    }

    /// Render the patches of a round's pending queries.
    pub async fn precrop_round(&self, round_id: RoundId) -> Result<usize> {
        let queries = self.store.round_queries(round_id).await?;
        let mut patches = Vec::with_capacity(queries.len());
        for query in &queries {
            patches.push(self.store.get_patch(query.patch_id).await?);
        }
        let n = self.materialize(&patches).await?;
        debug!(
            subsystem = "learn",
            component = "round_engine",
            op = "precrop",
            round_id,
            patches = n,
            "Round patches materialized"
        );
        Ok(n)
    }

    /// Ensure one patch per window of `spec` over `blob`.
    pub async fn ensure_grid(&self, blob: &Blob, spec: &PatchSpec) -> Result<Vec<Patch>> {
        let (width, height) = self.blobs.dimensions(blob).await?;
        let keys = dense_grid(spec, blob.id, width, height);
        let mut patches = Vec::with_capacity(keys.len());
        for key in &keys {
            patches.push(self.store.ensure_patch(key).await?);
        }
        debug!(
            subsystem = "learn",
            component = "round_engine",
            blob_id = blob.id,
            patch_spec = %spec.name,
            patches = patches.len(),
            "Grid ensured"
        );
        Ok(patches)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    async fn first_unseeded_patch(
        &self,
        dataset_id: DatasetId,
        seeded: &HashSet<PatchId>,
    ) -> Result<Option<Patch>> {
        for blob in self.store.dataset_blobs(dataset_id).await? {
            let found = self
                .store
                .blob_patches(blob.id)
                .await?
                .into_iter()
                .find(|p| !seeded.contains(&p.id));
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn materialize(&self, patches: &[Patch]) -> Result<usize> {
        let mut blob: Option<Blob> = None;
        for patch in patches {
            let current = match blob.take() {
                Some(b) if b.id == patch.blob_id() => b,
                _ => self.store.get_blob(patch.blob_id()).await?,
            };
            self.blobs.materialize(&current, patch).await?;
            blob = Some(current);
        }
        Ok(patches.len())
    }

    /// Concatenated vectors of `patches` under every spec, one row per patch.
    async fn feature_matrix(&self, patches: &[Patch], specs: &[FeatureSpec]) -> Result<Array2<f32>> {
        let mut per_spec = Vec::with_capacity(specs.len());
        for spec in specs {
            per_spec.push(self.features.compute_many(patches, spec).await?);
        }

        let dim: usize = per_spec
            .iter()
            .map(|vectors| vectors.first().map_or(0, Vec::len))
            .sum();
        let mut data = Vec::with_capacity(patches.len() * dim);
        for row in 0..patches.len() {
            let start = data.len();
            for vectors in &per_spec {
                data.extend_from_slice(&vectors[row]);
            }
            if data.len() - start != dim {
                return Err(Error::Extraction(format!(
                    "patch {} has a {}-dimensional vector, expected {}",
                    patches[row].id,
                    data.len() - start,
                    dim
                )));
            }
        }
        Array2::from_shape_vec((patches.len(), dim), data)
            .map_err(|e| Error::Internal(format!("feature matrix shape: {}", e)))
    }

    /// Fit a fresh estimator on a round's examples.
    async fn train(
        &self,
        round: &Round,
        examples: &[Example],
        specs: &[FeatureSpec],
    ) -> Result<Box<dyn Estimator>> {
        if specs.is_empty() {
            return Err(Error::Precondition(format!(
                "round {} has no feature specs to train on",
                round.id
            )));
        }
        if examples.is_empty() {
            return Err(Error::Precondition(format!("round {} has no examples", round.id)));
        }

        let mut patches = Vec::with_capacity(examples.len());
        for example in examples {
            patches.push(self.store.get_patch(example.patch_id).await?);
        }
        let labels: Vec<bool> = examples.iter().map(|e| e.value).collect();
        let matrix = self.feature_matrix(&patches, specs).await?;

        let mut estimator = self.estimators.create();
        let estimator = tokio::task::spawn_blocking(move || {
            estimator.train(matrix.view(), &labels).map(|_| estimator)
        })
        .await
        .map_err(|e| Error::Estimator(format!("training task panicked: {}", e)))??;

        debug!(
            subsystem = "learn",
            component = "round_engine",
            op = "train",
            round_id = round.id,
            example_count = examples.len(),
            "Estimator trained"
        );
        Ok(estimator)
    }

    async fn score(
        &self,
        estimator: &dyn Estimator,
        patches: &[Patch],
        specs: &[FeatureSpec],
    ) -> Result<Vec<NewPrediction>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }
        let matrix = self.feature_matrix(patches, specs).await?;
        let scores = estimator.score_many(matrix.view())?;
        Ok(patches
            .iter()
            .zip(scores)
            .map(|(patch, score)| NewPrediction {
                patch_id: patch.id,
                score,
            })
            .collect())
    }
}
