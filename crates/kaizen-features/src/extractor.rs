//! The feature extractor capability.

use image::RgbImage;
use ndarray::Array2;
use serde_json::Value as JsonValue;

use kaizen_core::{Error, ExtractorKind, Result};

/// Turns images into fixed-length feature vectors.
///
/// Extractors are stateful (a network-backed extractor holds a built
/// network) and are driven by one caller at a time; see
/// [`crate::ExtractorPool`] for the confinement that guarantees it.
pub trait FeatureExtractor: Send {
    /// Which algorithm this is.
    fn kind(&self) -> ExtractorKind;

    /// Apply spec parameters. Unknown keys are ignored, missing keys keep
    /// their defaults.
    fn configure(&mut self, params: &JsonValue) -> Result<()>;

    /// Length of every vector this extractor produces under its current
    /// configuration.
    fn dimension(&self) -> usize;

    /// Extract one image.
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<f32>>;

    /// Extract a batch. Row `i` of the result belongs to `images[i]`.
    fn extract_many(&mut self, images: &[RgbImage]) -> Result<Array2<f32>> {
        let dim = self.dimension();
        let mut data = Vec::with_capacity(images.len() * dim);
        for image in images {
            let row = self.extract(image)?;
            if row.len() != dim {
                return Err(Error::Extraction(format!(
                    "{} produced {} values, expected {}",
                    self.kind(),
                    row.len(),
                    dim
                )));
            }
            data.extend(row);
        }
        stack_rows(images.len(), dim, data)
    }

    /// Drop heavyweight state. The extractor stays usable and rebuilds what
    /// it needs on the next call.
    fn release(&mut self) {}
}

/// Shape a flat row-major buffer into an `(rows, dim)` matrix.
pub fn stack_rows(rows: usize, dim: usize, data: Vec<f32>) -> Result<Array2<f32>> {
    Array2::from_shape_vec((rows, dim), data)
        .map_err(|e| Error::Extraction(format!("feature matrix shape: {}", e)))
}

/// Read an optional parameter, falling back to `default` when absent.
pub(crate) fn param<T>(params: &JsonValue, key: &str, default: T) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    match params.get(key) {
        None | Some(JsonValue::Null) => Ok(default),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidInput(format!("parameter {}: {}", key, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_defaults_and_overrides() {
        let params = json!({"bins": 8, "flatten": null});
        assert_eq!(param(&params, "bins", 4usize).unwrap(), 8);
        assert!(!param(&params, "flatten", false).unwrap());
        assert_eq!(param(&params, "missing", 3u32).unwrap(), 3);
    }

    #[test]
    fn test_param_type_mismatch() {
        let params = json!({"bins": "many"});
        let err = param(&params, "bins", 4usize).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_stack_rows_rejects_ragged() {
        assert!(stack_rows(2, 3, vec![0.0; 5]).is_err());
        assert_eq!(stack_rows(0, 3, vec![]).unwrap().dim(), (0, 3));
    }
}
