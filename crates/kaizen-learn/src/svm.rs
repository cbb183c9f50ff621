//! L2-regularized, hinge-loss linear SVM.
//!
//! Solved in the dual by coordinate descent (Hsieh et al., 2008). The bias is
//! learned as the weight of a constant feature of value 1, and coordinates
//! are visited in a permutation drawn from a seeded generator, so the same
//! examples always yield the same model.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use kaizen_core::{defaults, Error, Result};

use crate::estimator::Estimator;

/// Linear support vector machine.
#[derive(Debug, Clone)]
pub struct LinearSvm {
    c: f32,
    threshold: f32,
    max_iter: usize,
    tolerance: f32,
    seed: u64,
    weights: Option<Array1<f32>>,
    bias: f32,
}

impl LinearSvm {
    pub fn new(c: f32, threshold: f32) -> Self {
        Self {
            c,
            threshold,
            max_iter: defaults::SVM_MAX_ITER,
            tolerance: defaults::SVM_TOLERANCE,
            seed: defaults::SVM_SEED,
            weights: None,
            bias: 0.0,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Learned weights, if trained.
    pub fn weights(&self) -> Option<ArrayView1<'_, f32>> {
        self.weights.as_ref().map(|w| w.view())
    }

    pub fn bias(&self) -> f32 {
        self.bias
    }
}

impl Estimator for LinearSvm {
    fn train(&mut self, examples: ArrayView2<'_, f32>, labels: &[bool]) -> Result<()> {
        let (n, dim) = examples.dim();
        if n == 0 {
            return Err(Error::Estimator("no training examples".into()));
        }
        if labels.len() != n {
            return Err(Error::Estimator(format!(
                "{} labels for {} examples",
                labels.len(),
                n
            )));
        }
        if labels.iter().all(|&v| v) || labels.iter().all(|&v| !v) {
            return Err(Error::Estimator(
                "training needs both positive and negative examples".into(),
            ));
        }
        if self.c.is_nan() || self.c <= 0.0 {
            return Err(Error::Estimator(format!("C must be positive, got {}", self.c)));
        }

        let y: Vec<f32> = labels.iter().map(|&v| if v { 1.0 } else { -1.0 }).collect();
        // Diagonal of the Gram matrix, including the constant bias feature.
        let q: Vec<f32> = examples.rows().into_iter().map(|r| r.dot(&r) + 1.0).collect();

        let mut alpha = vec![0.0f32; n];
        let mut w = Array1::<f32>::zeros(dim);
        let mut b = 0.0f32;
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut passes = 0;
        while passes < self.max_iter {
            passes += 1;
            order.shuffle(&mut rng);
            let mut pg_max = f32::NEG_INFINITY;
            let mut pg_min = f32::INFINITY;

            for &i in &order {
                let xi = examples.row(i);
                let g = y[i] * (w.dot(&xi) + b) - 1.0;
                let pg = if alpha[i] <= 0.0 {
                    g.min(0.0)
                } else if alpha[i] >= self.c {
                    g.max(0.0)
                } else {
                    g
                };
                pg_max = pg_max.max(pg);
                pg_min = pg_min.min(pg);

                if pg.abs() > 1e-12 {
                    let old = alpha[i];
                    alpha[i] = (old - g / q[i]).clamp(0.0, self.c);
                    let step = (alpha[i] - old) * y[i];
                    w.scaled_add(step, &xi);
                    b += step;
                }
            }

            if pg_max - pg_min <= self.tolerance {
                break;
            }
        }

        debug!(
            subsystem = "learn",
            component = "linear_svm",
            op = "train",
            examples = n,
            dim,
            passes,
            "SVM trained"
        );
        self.weights = Some(w);
        self.bias = b;
        Ok(())
    }

    fn score(&self, vector: ArrayView1<'_, f32>) -> Result<f32> {
        let w = self
            .weights
            .as_ref()
            .ok_or_else(|| Error::Estimator("scoring an untrained SVM".into()))?;
        if vector.len() != w.len() {
            return Err(Error::Estimator(format!(
                "vector has {} dimensions, model expects {}",
                vector.len(),
                w.len()
            )));
        }
        Ok(w.dot(&vector) + self.bias)
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}
