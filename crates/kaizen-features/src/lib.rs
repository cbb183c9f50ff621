//! # kaizen-features
//!
//! Feature extraction for kaizen.
//!
//! This crate provides:
//! - The [`FeatureExtractor`] capability and its four variants
//!   (`color_hist`, `hog`, `tiny_image`, `cnn`)
//! - Pluggable pretrained networks with fixed-batch rebuild planning
//! - A registry keyed by [`ExtractorKind`](kaizen_core::ExtractorKind)
//! - Per-spec extractor confinement ([`ExtractorPool`])
//! - The read-through [`FeatureCache`]

pub mod cache;
pub mod cnn;
pub mod color_hist;
pub mod extractor;
pub mod hog;
pub mod network;
pub mod pool;
pub mod registry;
pub mod tiny_image;

pub use cache::FeatureCache;
pub use cnn::{plan_batches, BatchSlice, Cnn};
pub use color_hist::ColorHist;
pub use extractor::{stack_rows, FeatureExtractor};
pub use hog::Hog;
pub use network::{DenseModel, DenseNetwork, JsonNetworkLoader, Network, NetworkInfo, NetworkLoader};
pub use pool::ExtractorPool;
pub use registry::{default_factory, ExtractorFactory, ExtractorRegistry};
pub use tiny_image::TinyImage;
