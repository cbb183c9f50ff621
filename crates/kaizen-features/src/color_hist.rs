//! Joint RGB color histogram.

use image::RgbImage;
use serde_json::Value as JsonValue;

use kaizen_core::{defaults, Error, ExtractorKind, Result};

use crate::extractor::{param, FeatureExtractor};

/// `bins³` histogram over `[0, 255]` per channel, normalized to a density
/// (the integral over the RGB cube is 1).
#[derive(Debug, Clone)]
pub struct ColorHist {
    bins: usize,
}

impl Default for ColorHist {
    fn default() -> Self {
        Self {
            bins: defaults::COLOR_HIST_BINS,
        }
    }
}

impl ColorHist {
    pub fn new(bins: usize) -> Self {
        Self { bins: bins.max(1) }
    }

    fn bin(&self, value: u8) -> usize {
        // Edges split [0, 255] evenly; 255 belongs to the last bin.
        let idx = (value as f32 * self.bins as f32 / 255.0) as usize;
        idx.min(self.bins - 1)
    }
}

impl FeatureExtractor for ColorHist {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::ColorHist
    }

    fn configure(&mut self, params: &JsonValue) -> Result<()> {
        let bins: usize = param(params, "bins", defaults::COLOR_HIST_BINS)?;
        if bins == 0 {
            return Err(Error::InvalidInput("bins must be positive".into()));
        }
        self.bins = bins;
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.bins.pow(3)
    }

    fn extract(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        let pixels = image.width() as usize * image.height() as usize;
        if pixels == 0 {
            return Err(Error::Extraction("color histogram of an empty image".into()));
        }

        let b = self.bins;
        let mut counts = vec![0u32; self.dimension()];
        for px in image.pixels() {
            let [r, g, bl] = px.0;
            counts[self.bin(r) * b * b + self.bin(g) * b + self.bin(bl)] += 1;
        }

        let bin_width = 255.0 / b as f64;
        let scale = 1.0 / (pixels as f64 * bin_width.powi(3));
        Ok(counts.iter().map(|&c| (c as f64 * scale) as f32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::json;

    #[test]
    fn test_dimension_follows_bins() {
        let mut hist = ColorHist::default();
        assert_eq!(hist.dimension(), 64);
        hist.configure(&json!({"bins": 2})).unwrap();
        assert_eq!(hist.dimension(), 8);
        assert!(hist.configure(&json!({"bins": 0})).is_err());
    }

    #[test]
    fn test_single_color_lands_in_one_bin() {
        let mut hist = ColorHist::new(2);
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 0, 255]));
        let v = hist.extract(&img).unwrap();
        let nonzero: Vec<usize> = (0..v.len()).filter(|&i| v[i] > 0.0).collect();
        // r=1, g=0, b=1 → 1*4 + 0*2 + 1
        assert_eq!(nonzero, vec![5]);
    }

    #[test]
    fn test_density_integrates_to_one() {
        let mut hist = ColorHist::new(4);
        let img = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 128]));
        let v = hist.extract(&img).unwrap();
        let bin_volume = (255.0f64 / 4.0).powi(3);
        let integral: f64 = v.iter().map(|&d| d as f64 * bin_volume).sum();
        assert!((integral - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let mut hist = ColorHist::default();
        assert!(hist.extract(&RgbImage::new(0, 0)).is_err());
    }
}
