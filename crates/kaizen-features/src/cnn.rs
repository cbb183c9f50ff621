//! Layer activations of a pretrained network, with batch planning.
//!
//! A network is built for a fixed batch dimension. For N images and a
//! maximum batch M, `extract_many` runs one pass with B = N when N ≤ M;
//! otherwise ⌊N/M⌋ passes with B = M and one trailing pass with B = N mod M
//! if that is non-zero. So a call builds at most two networks, and none when
//! the held network already matches. Rows come back in input order.

use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{s, Array2, Array4};
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use kaizen_core::{defaults, Error, ExtractorKind, Result};

use crate::extractor::{param, FeatureExtractor};
use crate::network::{Network, NetworkInfo, NetworkLoader};

/// A contiguous run of inputs processed in one network pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSlice {
    pub start: usize,
    pub len: usize,
}

impl BatchSlice {
    pub fn end(self) -> usize {
        self.start + self.len
    }
}

/// Split `total` inputs into passes of at most `max_batch`.
pub fn plan_batches(total: usize, max_batch: usize) -> Vec<BatchSlice> {
    if total == 0 {
        return Vec::new();
    }
    let chunk = max_batch.max(1);
    let mut slices = Vec::new();
    let mut start = 0;
    while start < total {
        let len = std::cmp::min(chunk, total - start);
        slices.push(BatchSlice { start, len });
        start += len;
    }
    slices
}

/// The `cnn` extractor.
pub struct Cnn {
    loader: Arc<dyn NetworkLoader>,
    max_batch: usize,
    model: String,
    layer: String,
    /// Output channel `i` takes input channel `channel_swap[i]`.
    channel_swap: [usize; 3],
    info: Option<NetworkInfo>,
    net: Option<Box<dyn Network>>,
}

impl Cnn {
    pub fn new(loader: Arc<dyn NetworkLoader>, max_batch: usize) -> Self {
        Self {
            loader,
            max_batch: max_batch.max(1),
            model: defaults::CNN_MODEL.to_string(),
            layer: defaults::CNN_LAYER.to_string(),
            channel_swap: [2, 1, 0],
            info: None,
            net: None,
        }
    }

    fn info(&mut self) -> Result<&NetworkInfo> {
        if self.info.is_none() {
            self.info = Some(self.loader.describe(&self.model, &self.layer)?);
        }
        self.info
            .as_ref()
            .ok_or_else(|| Error::Internal("network info missing after describe".into()))
    }

    /// Make sure the held network accepts exactly `batch` inputs.
    fn ensure_network(&mut self, batch: usize) -> Result<()> {
        if self.net.as_ref().is_some_and(|n| n.batch_size() == batch) {
            return Ok(());
        }
        // Drop the old network before building its replacement.
        self.net = None;
        debug!(
            subsystem = "features",
            component = "cnn",
            op = "build",
            model = %self.model,
            batch_size = batch,
            "Building network"
        );
        self.net = Some(self.loader.build(&self.model, &self.layer, batch)?);
        Ok(())
    }

    /// Crop to the input window from the top-left corner (images smaller
    /// than the window are resized up to it), swap channels, subtract the
    /// mean and lay out as CHW into `out`.
    fn preprocess_into(
        image: &RgbImage,
        info: &NetworkInfo,
        swap: [usize; 3],
        mut out: ndarray::ArrayViewMut3<'_, f32>,
    ) {
        let (w, h) = (info.width, info.height);
        let window = if image.width() >= w && image.height() >= h {
            imageops::crop_imm(image, 0, 0, w, h).to_image()
        } else {
            imageops::resize(image, w, h, FilterType::Triangle)
        };
        for (x, y, px) in window.enumerate_pixels() {
            for c in 0..info.channels.min(3) {
                out[[c, y as usize, x as usize]] = px.0[swap[c]] as f32 - info.mean[c];
            }
        }
    }
}

impl FeatureExtractor for Cnn {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Cnn
    }

    fn configure(&mut self, params: &JsonValue) -> Result<()> {
        let model: String = param(params, "model", defaults::CNN_MODEL.to_string())?;
        let layer: String = param(params, "layer_name", defaults::CNN_LAYER.to_string())?;
        let transpose: [usize; 3] = param(params, "transpose", [2, 0, 1])?;
        let channel_swap: [usize; 3] = param(params, "channel_swap", [2, 1, 0])?;

        if transpose != [2, 0, 1] {
            return Err(Error::InvalidInput(format!(
                "only the HWC→CHW transpose [2, 0, 1] is supported, got {:?}",
                transpose
            )));
        }
        let mut sorted = channel_swap;
        sorted.sort_unstable();
        if sorted != [0, 1, 2] {
            return Err(Error::InvalidInput(format!(
                "channel_swap must permute [0, 1, 2], got {:?}",
                channel_swap
            )));
        }

        let info = self.loader.describe(&model, &layer)?;
        if info.channels != 3 {
            return Err(Error::Extraction(format!(
                "model {} expects {} channels; only RGB input is supported",
                model, info.channels
            )));
        }
        self.model = model;
        self.layer = layer;
        self.channel_swap = channel_swap;
        self.info = Some(info);
        self.net = None;
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.info.as_ref().map_or(0, |i| i.output_dim)
    }

    fn extract(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        let rows = self.extract_many(std::slice::from_ref(image))?;
        Ok(rows.row(0).to_vec())
    }

    fn extract_many(&mut self, images: &[RgbImage]) -> Result<Array2<f32>> {
        let info = self.info()?.clone();
        let mut out = Array2::zeros((images.len(), info.output_dim));
        let plan = plan_batches(images.len(), self.max_batch);
        debug!(
            subsystem = "features",
            component = "cnn",
            op = "extract_many",
            images = images.len(),
            passes = plan.len(),
            max_batch = self.max_batch,
            "Batch plan"
        );

        for slice in plan {
            self.ensure_network(slice.len)?;
            let mut input = Array4::zeros((
                slice.len,
                info.channels,
                info.height as usize,
                info.width as usize,
            ));
            for (i, image) in images[slice.start..slice.end()].iter().enumerate() {
                Self::preprocess_into(
                    image,
                    &info,
                    self.channel_swap,
                    input.slice_mut(s![i, .., .., ..]),
                );
            }

            let net = self
                .net
                .as_mut()
                .ok_or_else(|| Error::Internal("network missing after build".into()))?;
            let activations = net.forward(input.view())?;
            if activations.dim() != (slice.len, info.output_dim) {
                return Err(Error::Extraction(format!(
                    "network returned {:?}, expected ({}, {})",
                    activations.dim(),
                    slice.len,
                    info.output_dim
                )));
            }
            out.slice_mut(s![slice.start..slice.end(), ..])
                .assign(&activations);
            trace!(
                subsystem = "features",
                component = "cnn",
                start = slice.start,
                batch_size = slice.len,
                "Pass complete"
            );
        }
        Ok(out)
    }

    fn release(&mut self) {
        self.net = None;
    }
}
