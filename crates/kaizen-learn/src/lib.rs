//! # kaizen-learn
//!
//! Active learning for kaizen: the estimator capability and its linear SVM,
//! uncertainty-based query selection, dense candidate grids, keyword
//! definition files, and the [`RoundEngine`] that ties them together.

pub mod engine;
pub mod estimator;
pub mod grid;
pub mod seeds;
pub mod selector;
pub mod svm;

pub use engine::{EngineConfig, RoundEngine};
pub use estimator::{Estimator, EstimatorFactory, LinearSvmFactory};
pub use grid::dense_grid;
pub use seeds::{find_blob, parse_definition, SeedRow};
pub use selector::select_uncertain;
pub use svm::LinearSvm;
