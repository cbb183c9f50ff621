//! Per-spec extractor confinement.
//!
//! One extractor instance exists per FeatureSpec per process. Each lives in
//! its own async mutex, so a network-backed instance is never driven by two
//! tasks at once, and the work itself runs on the blocking thread pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use image::RgbImage;
use ndarray::Array2;
use tracing::debug;

use kaizen_core::{Error, FeatureSpec, FeatureSpecId, Result};

use crate::extractor::FeatureExtractor;
use crate::registry::ExtractorRegistry;

type Slot = Arc<tokio::sync::Mutex<Option<Box<dyn FeatureExtractor>>>>;

/// Lazily created, mutex-confined extractors keyed by spec id.
pub struct ExtractorPool {
    registry: Arc<ExtractorRegistry>,
    slots: Mutex<HashMap<FeatureSpecId, Slot>>,
}

impl ExtractorPool {
    pub fn new(registry: ExtractorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, spec_id: FeatureSpecId) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::Internal("extractor pool lock poisoned".into()))?;
        Ok(slots.entry(spec_id).or_default().clone())
    }

    /// Run `extract_many` on the feature spec's extractor, creating it on first use.
    pub async fn extract_many(
        &self,
        spec: &FeatureSpec,
        images: Vec<RgbImage>,
    ) -> Result<Array2<f32>> {
        let mut guard = self.slot(spec.id)?.lock_owned().await;
        let registry = self.registry.clone();
        let spec = spec.clone();

        tokio::task::spawn_blocking(move || {
            if guard.is_none() {
                debug!(
                    subsystem = "features",
                    component = "pool",
                    spec_id = spec.id,
                    kind = %spec.kind,
                    "Creating extractor"
                );
                *guard = Some(registry.create(&spec)?);
            }
            match guard.as_mut() {
                Some(extractor) => extractor.extract_many(&images),
                None => Err(Error::Internal("extractor missing after creation".into())),
            }
        })
        .await
        .map_err(|e| Error::Extraction(format!("extraction task panicked: {}", e)))?
    }

    /// Release and drop every extractor; the next use recreates it.
    pub async fn release_all(&self) -> Result<usize> {
        let slots: Vec<Slot> = {
            let slots = self
                .slots
                .lock()
                .map_err(|_| Error::Internal("extractor pool lock poisoned".into()))?;
            slots.values().cloned().collect()
        };

        let mut released = 0;
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(mut extractor) = guard.take() {
                extractor.release();
                released += 1;
            }
        }
        debug!(
            subsystem = "features",
            component = "pool",
            op = "release_all",
            released,
            "Extractors released"
        );
        Ok(released)
    }

    /// Number of specs with a live extractor.
    pub async fn live_count(&self) -> Result<usize> {
        let slots: Vec<Slot> = {
            let slots = self
                .slots
                .lock()
                .map_err(|_| Error::Internal("extractor pool lock poisoned".into()))?;
            slots.values().cloned().collect()
        };
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        Ok(live)
    }
}
