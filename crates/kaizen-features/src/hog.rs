//! Histogram of oriented gradients (Dalal & Triggs).
//!
//! Computed over the green channel resized to `window_size²`. Gradients use
//! centered differences (zero on the border rows/columns), orientations are
//! unsigned over `[0°, 180°)`, each cell averages gradient magnitude into
//! its orientation bin, and overlapping blocks of cells are L2-Hys
//! normalized. Output order is block row, block column, cell row, cell
//! column, orientation.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use serde_json::Value as JsonValue;

use kaizen_core::{defaults, Error, ExtractorKind, Result};

use crate::extractor::{param, FeatureExtractor};

const L2HYS_CLIP: f32 = 0.2;
const EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct Hog {
    orientations: usize,
    pixels_per_cell: usize,
    cells_per_block: usize,
    window_size: u32,
}

impl Default for Hog {
    fn default() -> Self {
        Self {
            orientations: defaults::HOG_ORIENTATIONS,
            pixels_per_cell: defaults::HOG_PIXELS_PER_CELL,
            cells_per_block: defaults::HOG_CELLS_PER_BLOCK,
            window_size: defaults::HOG_WINDOW_SIZE,
        }
    }
}

impl Hog {
    fn cells(&self) -> usize {
        self.window_size as usize / self.pixels_per_cell
    }

    fn blocks(&self) -> usize {
        (self.cells() + 1).saturating_sub(self.cells_per_block)
    }

    fn cell_histograms(&self, img: &[f32], side: usize) -> Vec<f32> {
        let n_cells = self.cells();
        let ppc = self.pixels_per_cell;
        let bin_width = 180.0 / self.orientations as f32;
        let mut hist = vec![0.0f32; n_cells * n_cells * self.orientations];

        for r in 0..n_cells * ppc {
            for c in 0..n_cells * ppc {
                let gx = if c > 0 && c + 1 < side {
                    img[r * side + c + 1] - img[r * side + c - 1]
                } else {
                    0.0
                };
                let gy = if r > 0 && r + 1 < side {
                    img[(r + 1) * side + c] - img[(r - 1) * side + c]
                } else {
                    0.0
                };
                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                let angle = gy.atan2(gx).to_degrees().rem_euclid(180.0);
                let bin = ((angle / bin_width) as usize).min(self.orientations - 1);
                let cell = (r / ppc) * n_cells + c / ppc;
                hist[cell * self.orientations + bin] += magnitude;
            }
        }

        let cell_area = (ppc * ppc) as f32;
        hist.iter_mut().for_each(|h| *h /= cell_area);
        hist
    }
}

fn l2_hys(block: &mut [f32]) {
    let norm = |v: &[f32]| (v.iter().map(|x| x * x).sum::<f32>() + EPS * EPS).sqrt();
    let n = norm(block);
    block.iter_mut().for_each(|x| *x = (*x / n).min(L2HYS_CLIP));
    let n = norm(block);
    block.iter_mut().for_each(|x| *x /= n);
}

impl FeatureExtractor for Hog {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Hog
    }

    fn configure(&mut self, params: &JsonValue) -> Result<()> {
        let next = Hog {
            orientations: param(params, "orientations", defaults::HOG_ORIENTATIONS)?,
            pixels_per_cell: param(params, "pixels_per_cell", defaults::HOG_PIXELS_PER_CELL)?,
            cells_per_block: param(params, "cells_per_block", defaults::HOG_CELLS_PER_BLOCK)?,
            window_size: param(params, "window_size", defaults::HOG_WINDOW_SIZE)?,
        };
        if next.orientations == 0 || next.pixels_per_cell == 0 || next.cells_per_block == 0 {
            return Err(Error::InvalidInput("hog parameters must be positive".into()));
        }
        if next.blocks() == 0 {
            return Err(Error::InvalidInput(format!(
                "hog window {} too small for {} cells of {} px",
                next.window_size, next.cells_per_block, next.pixels_per_cell
            )));
        }
        *self = next;
        Ok(())
    }

    fn dimension(&self) -> usize {
        let b = self.blocks();
        b * b * self.cells_per_block * self.cells_per_block * self.orientations
    }

    fn extract(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Extraction("hog of an empty image".into()));
        }
        let green = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            Luma([image.get_pixel(x, y).0[1]])
        });
        let side = self.window_size;
        let window = imageops::resize(&green, side, side, FilterType::Triangle);
        let pixels: Vec<f32> = window.pixels().map(|p| p.0[0] as f32 / 255.0).collect();

        let cells = self.cell_histograms(&pixels, side as usize);
        let n_cells = self.cells();
        let cpb = self.cells_per_block;
        let ori = self.orientations;

        let mut out = Vec::with_capacity(self.dimension());
        for br in 0..self.blocks() {
            for bc in 0..self.blocks() {
                let mut block = Vec::with_capacity(cpb * cpb * ori);
                for cr in br..br + cpb {
                    for cc in bc..bc + cpb {
                        let start = (cr * n_cells + cc) * ori;
                        block.extend_from_slice(&cells[start..start + ori]);
                    }
                }
                l2_hys(&mut block);
                out.extend(block);
            }
        }
        Ok(out)
    }
}
