//! # kaizen-core
//!
//! Core types, traits, and abstractions for the kaizen active-learning engine.
//!
//! This crate provides the entity model, the repository/queue/blob-store
//! interfaces every other crate programs against, the shared error type and
//! the runtime configuration.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::KaizenConfig;
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
