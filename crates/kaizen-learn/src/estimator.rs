//! Estimator capability.
//!
//! The round engine only ever sees `dyn Estimator`; the concrete model is
//! chosen once, through an [`EstimatorFactory`], from configuration.

use ndarray::{ArrayView1, ArrayView2};

use kaizen_core::{defaults, KaizenConfig, Result};

use crate::svm::LinearSvm;

/// A binary classifier over fixed-length feature vectors.
pub trait Estimator: Send + Sync {
    /// Fit on one row per example. `labels[i]` is the value of row `i`.
    fn train(&mut self, examples: ArrayView2<'_, f32>, labels: &[bool]) -> Result<()>;

    /// Decision value of one vector. Larger means more positive.
    fn score(&self, vector: ArrayView1<'_, f32>) -> Result<f32>;

    /// Decision values of many vectors, in row order.
    fn score_many(&self, vectors: ArrayView2<'_, f32>) -> Result<Vec<f32>> {
        vectors.rows().into_iter().map(|row| self.score(row)).collect()
    }

    /// Score at which the estimator is least certain.
    fn threshold(&self) -> f32;
}

/// Builds untrained estimators.
pub trait EstimatorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Estimator>;

    /// Threshold of the estimators this factory builds.
    fn threshold(&self) -> f32;
}

/// Factory for [`LinearSvm`].
#[derive(Debug, Clone)]
pub struct LinearSvmFactory {
    pub c: f32,
    pub threshold: f32,
    pub max_iter: usize,
    pub tolerance: f32,
    pub seed: u64,
}

impl Default for LinearSvmFactory {
    fn default() -> Self {
        Self {
            c: defaults::SVM_C,
            threshold: defaults::THRESHOLD,
            max_iter: defaults::SVM_MAX_ITER,
            tolerance: defaults::SVM_TOLERANCE,
            seed: defaults::SVM_SEED,
        }
    }
}

impl LinearSvmFactory {
    pub fn from_config(config: &KaizenConfig) -> Self {
        Self {
            c: config.svm_c,
            threshold: config.threshold,
            ..Self::default()
        }
    }
}

impl EstimatorFactory for LinearSvmFactory {
    fn create(&self) -> Box<dyn Estimator> {
        Box::new(
            LinearSvm::new(self.c, self.threshold)
                .with_max_iter(self.max_iter)
                .with_tolerance(self.tolerance)
                .with_seed(self.seed),
        )
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_from_config() {
        let config = KaizenConfig::default().with_svm_c(0.5).with_threshold(0.25);
        let factory = LinearSvmFactory::from_config(&config);
        assert_eq!(factory.c, 0.5);
        assert_eq!(factory.threshold(), 0.25);
        assert_eq!(factory.create().threshold(), 0.25);
    }
}
