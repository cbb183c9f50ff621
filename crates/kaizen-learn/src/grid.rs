//! Dense candidate grids.

use kaizen_core::{BlobId, PatchKey, PatchSpec};

/// Stride of a window that shares `overlap` of itself with its neighbour.
fn stride(window: i32, overlap: f32) -> i32 {
    let step = (window as f32 * (1.0 - overlap.clamp(0.0, 0.99))).round() as i32;
    step.max(1)
}

/// Every window of `spec` that fits inside a `width`×`height` image,
/// row-major from the top-left corner. With `fliplr`, each window is
/// followed by its mirrored copy.
pub fn dense_grid(spec: &PatchSpec, blob_id: BlobId, width: u32, height: u32) -> Vec<PatchKey> {
    let (w, h) = (spec.width, spec.height);
    if w <= 0 || h <= 0 || w as u32 > width || h as u32 > height {
        return Vec::new();
    }
    let (sx, sy) = (stride(w, spec.x_overlap), stride(h, spec.y_overlap));

    let mut keys = Vec::new();
    let mut y = 0;
    while y + h <= height as i32 {
        let mut x = 0;
        while x + w <= width as i32 {
            let key = PatchKey::new(blob_id, x, y, w, h);
            keys.push(key);
            if spec.fliplr {
                keys.push(key.mirrored());
            }
            x += sx;
        }
        y += sy;
    }
    keys
}
