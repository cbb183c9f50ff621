//! Pretrained networks behind the `cnn` extractor.
//!
//! A [`Network`] is built for one fixed batch dimension; running a batch of
//! any other size requires building a new one through its
//! [`NetworkLoader`]. The shipped loader reads dense (fully connected)
//! models from `<models_dir>/<model>/model.json`:
//!
//! ```json
//! {
//!   "input": { "width": 227, "height": 227, "channels": 3 },
//!   "mean": [104.0, 117.0, 123.0],
//!   "layers": [
//!     { "name": "fc6", "weights": [[...], ...], "bias": [...] },
//!     { "name": "fc7", "weights": [[...], ...], "bias": [...] }
//!   ]
//! }
//! ```
//!
//! Every layer is followed by a ReLU. `weights` is `out × in`, where the
//! first layer's `in` is `channels × height × width` of the CHW input.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ndarray::{Array1, Array2, ArrayView4, Axis};
use serde::Deserialize;
use tracing::debug;

use kaizen_core::{Error, Result};

/// Static facts about a model, known before any network is built.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    /// Input window width in pixels.
    pub width: u32,
    /// Input window height in pixels.
    pub height: u32,
    pub channels: usize,
    /// Per-channel mean subtracted after the channel swap.
    pub mean: Vec<f32>,
    /// Width of the extracted layer's activation.
    pub output_dim: usize,
}

/// A network instantiated for a fixed batch size.
pub trait Network: Send {
    /// Batch dimension this network was built for.
    fn batch_size(&self) -> usize;

    /// Run a `(batch, channels, height, width)` input; returns the extracted
    /// layer's activation as `(batch, output_dim)`.
    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>>;
}

/// Builds networks for a model and layer.
pub trait NetworkLoader: Send + Sync {
    /// Describe a model without building a network.
    fn describe(&self, model: &str, layer: &str) -> Result<NetworkInfo>;

    /// Build a network for exactly `batch_size` inputs.
    fn build(&self, model: &str, layer: &str, batch_size: usize) -> Result<Box<dyn Network>>;
}

#[derive(Debug, Deserialize)]
struct InputShape {
    width: u32,
    height: u32,
    #[serde(default = "three")]
    channels: usize,
}

fn three() -> usize {
    3
}

#[derive(Debug, Deserialize)]
struct LayerFile {
    name: String,
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    input: InputShape,
    #[serde(default)]
    mean: Vec<f32>,
    layers: Vec<LayerFile>,
}

#[derive(Debug)]
struct DenseLayer {
    name: String,
    /// `out × in`
    weights: Array2<f32>,
    bias: Array1<f32>,
}

/// A parsed dense model.
#[derive(Debug)]
pub struct DenseModel {
    width: u32,
    height: u32,
    channels: usize,
    mean: Vec<f32>,
    layers: Vec<DenseLayer>,
}

impl DenseModel {
    /// Parse and validate a model from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: ModelFile = serde_json::from_str(text)?;
        let channels = file.input.channels;
        let mean = if file.mean.is_empty() {
            vec![0.0; channels]
        } else {
            file.mean
        };
        if mean.len() != channels {
            return Err(Error::Extraction(format!(
                "mean has {} entries for {} channels",
                mean.len(),
                channels
            )));
        }

        let mut expected_in = channels * (file.input.width * file.input.height) as usize;
        let mut layers = Vec::with_capacity(file.layers.len());
        for layer in file.layers {
            let rows = layer.weights.len();
            let cols = layer.weights.first().map_or(0, Vec::len);
            if rows == 0 || cols != expected_in || layer.bias.len() != rows {
                return Err(Error::Extraction(format!(
                    "layer {}: expected {}-wide weights and {} biases",
                    layer.name, expected_in, rows
                )));
            }
            let flat: Vec<f32> = layer.weights.into_iter().flatten().collect();
            let weights = Array2::from_shape_vec((rows, cols), flat).map_err(|_| {
                Error::Extraction(format!("layer {}: ragged weight rows", layer.name))
            })?;
            layers.push(DenseLayer {
                name: layer.name,
                weights,
                bias: Array1::from(layer.bias),
            });
            expected_in = rows;
        }

        Ok(Self {
            width: file.input.width,
            height: file.input.height,
            channels,
            mean,
            layers,
        })
    }

    fn layer_index(&self, layer: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.name == layer)
            .ok_or_else(|| Error::Extraction(format!("model has no layer named {}", layer)))
    }

    /// Describe the activation of `layer`.
    pub fn info(&self, layer: &str) -> Result<NetworkInfo> {
        let idx = self.layer_index(layer)?;
        Ok(NetworkInfo {
            width: self.width,
            height: self.height,
            channels: self.channels,
            mean: self.mean.clone(),
            output_dim: self.layers[idx].weights.nrows(),
        })
    }
}

/// A dense model instantiated for one batch size.
pub struct DenseNetwork {
    model: Arc<DenseModel>,
    upto: usize,
    batch_size: usize,
}

impl DenseNetwork {
    pub fn new(model: Arc<DenseModel>, layer: &str, batch_size: usize) -> Result<Self> {
        let upto = model.layer_index(layer)?;
        Ok(Self {
            model,
            upto,
            batch_size,
        })
    }
}

impl Network for DenseNetwork {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let batch = input.len_of(Axis(0));
        if batch != self.batch_size {
            return Err(Error::Extraction(format!(
                "network built for batch {} received {}",
                self.batch_size, batch
            )));
        }
        let flat_len = input.len() / batch.max(1);
        let mut act = input
            .to_owned()
            .into_shape_with_order((batch, flat_len))
            .map_err(|e| Error::Extraction(format!("input shape: {}", e)))?;

        for layer in &self.model.layers[..=self.upto] {
            act = act.dot(&layer.weights.t()) + &layer.bias;
            act.mapv_inplace(|x| x.max(0.0));
        }
        Ok(act)
    }
}

/// Loads dense JSON models from a directory, caching parsed models.
pub struct JsonNetworkLoader {
    models_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<DenseModel>>>,
}

impl JsonNetworkLoader {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn model(&self, name: &str) -> Result<Arc<DenseModel>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Internal("model cache lock poisoned".into()))?;
        if let Some(model) = cache.get(name) {
            return Ok(model.clone());
        }

        let path = self.models_dir.join(name).join("model.json");
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Extraction(format!("cannot read model {}: {}", path.display(), e))
        })?;
        let model = Arc::new(DenseModel::from_json(&text)?);
        debug!(
            subsystem = "features",
            component = "cnn",
            model = name,
            layers = model.layers.len(),
            "Model loaded"
        );
        cache.insert(name.to_string(), model.clone());
        Ok(model)
    }
}

impl NetworkLoader for JsonNetworkLoader {
    fn describe(&self, model: &str, layer: &str) -> Result<NetworkInfo> {
        self.model(model)?.info(layer)
    }

    fn build(&self, model: &str, layer: &str, batch_size: usize) -> Result<Box<dyn Network>> {
        Ok(Box::new(DenseNetwork::new(self.model(model)?, layer, batch_size)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    /// 1×1 RGB input; fc1 sums channels, fc2 doubles then shifts.
    const TINY_MODEL: &str = r#"{
        "input": {"width": 1, "height": 1, "channels": 3},
        "mean": [0.0, 0.0, 0.0],
        "layers": [
            {"name": "fc1", "weights": [[1.0, 1.0, 1.0], [-1.0, 0.0, 0.0]], "bias": [0.0, 0.0]},
            {"name": "fc2", "weights": [[2.0, 0.0]], "bias": [-1.0]}
        ]
    }"#;

    #[test]
    fn test_dense_model_info() {
        let model = DenseModel::from_json(TINY_MODEL).unwrap();
        let info = model.info("fc1").unwrap();
        assert_eq!((info.width, info.height, info.channels), (1, 1, 3));
        assert_eq!(info.output_dim, 2);
        assert_eq!(model.info("fc2").unwrap().output_dim, 1);
        assert!(model.info("fc9").is_err());
    }

    #[test]
    fn test_dense_model_rejects_bad_shapes() {
        let bad = r#"{"input": {"width": 1, "height": 1}, "layers": [
            {"name": "fc1", "weights": [[1.0, 1.0]], "bias": [0.0]}]}"#;
        assert!(DenseModel::from_json(bad).is_err());
    }

    #[test]
    fn test_forward_applies_relu_per_layer() {
        let model = Arc::new(DenseModel::from_json(TINY_MODEL).unwrap());
        let mut net = DenseNetwork::new(model, "fc2", 2).unwrap();
        let input = Array4::from_shape_vec((2, 3, 1, 1), vec![1.0, 2.0, 3.0, -5.0, 0.0, 0.0])
            .unwrap();
        let out = net.forward(input.view()).unwrap();
        // sample 0: fc1 = [6, 0] → fc2 = 11; sample 1: fc1 = [0, 5] → fc2 = relu(-1) = 0
        assert_eq!(out.dim(), (2, 1));
        assert_eq!(out[[0, 0]], 11.0);
        assert_eq!(out[[1, 0]], 0.0);
    }

    #[test]
    fn test_forward_enforces_batch_size() {
        let model = Arc::new(DenseModel::from_json(TINY_MODEL).unwrap());
        let mut net = DenseNetwork::new(model, "fc1", 3).unwrap();
        let input = Array4::<f32>::zeros((2, 3, 1, 1));
        assert!(net.forward(input.view()).is_err());
    }

    #[test]
    fn test_json_loader_reads_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tiny")).unwrap();
        std::fs::write(dir.path().join("tiny/model.json"), TINY_MODEL).unwrap();

        let loader = JsonNetworkLoader::new(dir.path());
        assert_eq!(loader.describe("tiny", "fc1").unwrap().output_dim, 2);
        assert_eq!(loader.build("tiny", "fc2", 4).unwrap().batch_size(), 4);
        assert!(loader.describe("missing", "fc1").is_err());
    }
}
