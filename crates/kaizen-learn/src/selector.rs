//! Uncertainty sampling.

use std::cmp::Ordering;

use tracing::debug;

use kaizen_core::{PatchId, Prediction};

/// Pick up to `k` patches whose scores lie closest to `threshold`.
///
/// Ties on distance go to the lower patch id, so the selection is a pure
/// function of the predictions. NaN scores sort last.
pub fn select_uncertain(predictions: &[Prediction], threshold: f32, k: usize) -> Vec<PatchId> {
    let mut ranked: Vec<(f32, PatchId)> = predictions
        .iter()
        .map(|p| ((p.score - threshold).abs(), p.patch_id))
        .collect();

    ranked.sort_by(|a, b| match (a.0.is_nan(), b.0.is_nan()) {
        (false, false) => a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => a.1.cmp(&b.1),
    });
    ranked.truncate(k);

    debug!(
        subsystem = "learn",
        component = "selector",
        candidates = predictions.len(),
        threshold,
        selected = ranked.len(),
        "Uncertain patches selected"
    );
    ranked.into_iter().map(|(_, patch_id)| patch_id).collect()
}
