//! Downsampled pixel vector.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde_json::Value as JsonValue;

use kaizen_core::{defaults, ExtractorKind, Result};

use crate::extractor::{param, FeatureExtractor};

/// Luminance weights (ITU-R BT.709).
pub const LUMA: [f32; 3] = [0.2125, 0.7154, 0.0721];

/// Image resized to `size × size` and flattened row-major to values in
/// `[0, 1]`; with `flatten`, reduced to luminance first.
#[derive(Debug, Clone)]
pub struct TinyImage {
    size: u32,
    flatten: bool,
}

impl Default for TinyImage {
    fn default() -> Self {
        Self {
            size: defaults::TINY_IMAGE_SIZE,
            flatten: false,
        }
    }
}

impl FeatureExtractor for TinyImage {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::TinyImage
    }

    fn configure(&mut self, params: &JsonValue) -> Result<()> {
        self.flatten = param(params, "flatten", false)?;
        Ok(())
    }

    fn dimension(&self) -> usize {
        let channels = if self.flatten { 1 } else { 3 };
        (self.size * self.size) as usize * channels
    }

    fn extract(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        let tiny = imageops::resize(image, self.size, self.size, FilterType::Triangle);
        let mut out = Vec::with_capacity(self.dimension());
        for px in tiny.pixels() {
            let [r, g, b] = px.0.map(|c| c as f32 / 255.0);
            if self.flatten {
                out.push(LUMA[0] * r + LUMA[1] * g + LUMA[2] * b);
            } else {
                out.extend([r, g, b]);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::json;

    #[test]
    fn test_dimension_rgb_and_flat() {
        let mut tiny = TinyImage::default();
        assert_eq!(tiny.dimension(), 3072);
        tiny.configure(&json!({"flatten": true})).unwrap();
        assert_eq!(tiny.dimension(), 1024);
    }

    #[test]
    fn test_uniform_image_values() {
        let mut tiny = TinyImage::default();
        let img = RgbImage::from_pixel(50, 70, Rgb([255, 0, 51]));
        let v = tiny.extract(&img).unwrap();
        assert_eq!(v.len(), 3072);
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!(v[1].abs() < 1e-6);
        assert!((v[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_flatten_uses_luminance() {
        let mut tiny = TinyImage::default();
        tiny.configure(&json!({"flatten": true})).unwrap();
        let img = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
        let v = tiny.extract(&img).unwrap();
        assert!(v.iter().all(|&y| (y - 1.0).abs() < 1e-4));
    }
}
