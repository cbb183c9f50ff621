//! Registry mapping extractor kinds to constructors.

use std::collections::HashMap;
use std::sync::Arc;

use kaizen_core::{Error, ExtractorKind, FeatureSpec, KaizenConfig, Result};

use crate::cnn::Cnn;
use crate::color_hist::ColorHist;
use crate::extractor::FeatureExtractor;
use crate::hog::Hog;
use crate::network::{JsonNetworkLoader, NetworkLoader};
use crate::tiny_image::TinyImage;

/// Builds a fresh, unconfigured extractor.
pub type ExtractorFactory = Arc<dyn Fn() -> Box<dyn FeatureExtractor> + Send + Sync>;

/// Factory for an extractor with a `Default` configuration.
pub fn default_factory<E>() -> ExtractorFactory
where
    E: FeatureExtractor + Default + 'static,
{
    Arc::new(|| Box::new(E::default()) as Box<dyn FeatureExtractor>)
}

/// Registry of extractor constructors, keyed by kind.
pub struct ExtractorRegistry {
    factories: HashMap<ExtractorKind, ExtractorFactory>,
}

impl ExtractorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with all four extractors; networks load from the configured
    /// models directory.
    pub fn with_defaults(config: &KaizenConfig) -> Self {
        let loader: Arc<dyn NetworkLoader> = Arc::new(JsonNetworkLoader::new(&config.models_dir));
        Self::with_network_loader(loader, config.cnn_max_batch)
    }

    /// Registry with all four extractors and a custom network loader.
    pub fn with_network_loader(loader: Arc<dyn NetworkLoader>, max_batch: usize) -> Self {
        let mut registry = Self::new();
        registry.register(ExtractorKind::ColorHist, default_factory::<ColorHist>());
        registry.register(ExtractorKind::Hog, default_factory::<Hog>());
        registry.register(ExtractorKind::TinyImage, default_factory::<TinyImage>());
        registry.register(
            ExtractorKind::Cnn,
            Arc::new(move || {
                Box::new(Cnn::new(loader.clone(), max_batch)) as Box<dyn FeatureExtractor>
            }),
        );
        registry
    }

    /// Register a constructor. Replaces any existing one for the same kind.
    pub fn register(&mut self, kind: ExtractorKind, factory: ExtractorFactory) {
        self.factories.insert(kind, factory);
    }

    /// Build and configure the extractor for a feature spec.
    pub fn create(&self, spec: &FeatureSpec) -> Result<Box<dyn FeatureExtractor>> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            Error::Internal(format!("No extractor registered for kind: {}", spec.kind))
        })?;
        let mut extractor = factory();
        extractor.configure(&spec.params)?;
        Ok(extractor)
    }

    /// List all kinds that have registered constructors.
    pub fn available_kinds(&self) -> Vec<ExtractorKind> {
        self.factories.keys().copied().collect()
    }

    /// Check if a constructor is registered for the given kind.
    pub fn has_factory(&self, kind: ExtractorKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(kind: ExtractorKind, params: serde_json::Value) -> FeatureSpec {
        FeatureSpec {
            id: 1,
            dataset_id: 1,
            kind,
            params,
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = ExtractorRegistry::new();
        assert!(registry.available_kinds().is_empty());
        assert!(!registry.has_factory(ExtractorKind::Hog));
        let err = registry
            .create(&spec(ExtractorKind::Hog, json!({})))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_defaults_register_every_kind() {
        let registry = ExtractorRegistry::with_defaults(&KaizenConfig::default());
        let mut kinds = registry.available_kinds();
        kinds.sort_by_key(|k| k.as_str());
        assert_eq!(kinds.len(), 4);
        assert!(registry.has_factory(ExtractorKind::Cnn));
    }

    #[test]
    fn test_create_applies_params() {
        let registry = ExtractorRegistry::with_defaults(&KaizenConfig::default());
        let hist = registry
            .create(&spec(ExtractorKind::ColorHist, json!({"bins": 3})))
            .unwrap();
        assert_eq!(hist.kind(), ExtractorKind::ColorHist);
        assert_eq!(hist.dimension(), 27);
    }

    #[test]
    fn test_create_cnn_without_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = KaizenConfig::default().with_models_dir(dir.path());
        let registry = ExtractorRegistry::with_defaults(&config);
        assert!(registry
            .create(&spec(ExtractorKind::Cnn, json!({"model": "nope"})))
            .is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ExtractorRegistry::new();
        registry.register(ExtractorKind::Hog, default_factory::<TinyImage>());
        let extractor = registry.create(&spec(ExtractorKind::Hog, json!({}))).unwrap();
        assert_eq!(extractor.kind(), ExtractorKind::TinyImage);
    }
}
