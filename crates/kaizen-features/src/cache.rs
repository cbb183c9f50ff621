//! Read-through feature cache.
//!
//! A `(patch, spec)` pair is extracted at most once: a stored vector is
//! always reused, and a fresh one is written insert-if-absent. When a
//! concurrent writer wins the insert, its vector is the one returned, so
//! every caller sees the same stored value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use tracing::{debug, trace};

use kaizen_core::{Blob, BlobId, BlobStore, Feature, FeatureSpec, Patch, Result, Store};

use crate::pool::ExtractorPool;

/// Feature cache over a store, a blob store and an extractor pool.
#[derive(Clone)]
pub struct FeatureCache {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    pool: Arc<ExtractorPool>,
}

impl FeatureCache {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, pool: Arc<ExtractorPool>) -> Self {
        Self { store, blobs, pool }
    }

    /// Vector of one patch under one spec.
    pub async fn get_or_compute(&self, patch: &Patch, spec: &FeatureSpec) -> Result<Vec<f32>> {
        let mut vectors = self.compute_many(std::slice::from_ref(patch), spec).await?;
        Ok(vectors.pop().unwrap_or_default())
    }

    /// Vectors of many patches under one spec, in patch order. All misses
    /// go through a single `extract_many` call.
    pub async fn compute_many(&self, patches: &[Patch], spec: &FeatureSpec) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(patches.len());
        let mut misses = Vec::new();
        for (i, patch) in patches.iter().enumerate() {
            let cached = self.store.get_feature(patch.id, spec.id).await?;
            if cached.is_none() {
                misses.push(i);
            }
            vectors.push(cached.map(|f| f.vector));
        }

        if !misses.is_empty() {
            let images = self.materialize(patches, &misses).await?;
            let matrix = self.pool.extract_many(spec, images).await?;

            for (row, &i) in matrix.rows().into_iter().zip(&misses) {
                let feature = Feature {
                    patch_id: patches[i].id,
                    spec_id: spec.id,
                    vector: row.to_vec(),
                };
                let vector = if self.store.insert_feature(&feature).await? {
                    feature.vector
                } else {
                    // Lost the insert race; the stored vector wins.
                    self.store
                        .get_feature(feature.patch_id, spec.id)
                        .await?
                        .map_or(feature.vector, |f| f.vector)
                };
                trace!(
                    subsystem = "features",
                    component = "feature_cache",
                    patch_id = patches[i].id,
                    spec_id = spec.id,
                    "Feature stored"
                );
                vectors[i] = Some(vector);
            }
        }

        debug!(
            subsystem = "features",
            component = "feature_cache",
            op = "compute_many",
            spec_id = spec.id,
            hits = patches.len() - misses.len(),
            misses = misses.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Features resolved"
        );
        Ok(vectors.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Compute every patch under every spec, one batch per spec.
    pub async fn analyze(&self, patches: &[Patch], specs: &[FeatureSpec]) -> Result<()> {
        for spec in specs {
            self.compute_many(patches, spec).await?;
        }
        Ok(())
    }

    /// Release every extractor. They are recreated on next use.
    pub async fn release(&self) -> Result<usize> {
        self.pool.release_all().await
    }

    async fn materialize(&self, patches: &[Patch], which: &[usize]) -> Result<Vec<RgbImage>> {
        let mut blobs: HashMap<BlobId, Blob> = HashMap::new();
        let mut images = Vec::with_capacity(which.len());
        for &i in which {
            let patch = &patches[i];
            let blob = match blobs.get(&patch.blob_id()) {
                Some(blob) => blob.clone(),
                None => {
                    let blob = self.store.get_blob(patch.blob_id()).await?;
                    blobs.insert(blob.id, blob.clone());
                    blob
                }
            };
            let bytes = self.blobs.materialize(&blob, patch).await?;
            images.push(image::load_from_memory(&bytes)?.to_rgb8());
        }
        Ok(images)
    }
}
