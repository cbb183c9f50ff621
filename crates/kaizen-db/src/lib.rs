//! # kaizen-db
//!
//! Storage layer for kaizen.
//!
//! This crate provides:
//! - A connection pool sized for the job worker
//! - PostgreSQL implementations of every store repository, with the feature
//!   cache in a pgvector column
//! - A durable job queue with counting barriers
//! - An in-memory store and queue with the same uniqueness rules
//! - A filesystem blob store with a crop cache
//!
//! ## Example
//!
//! ```rust,ignore
//! use kaizen_db::{Database, DatasetRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/kaizen").await?;
//!     let dataset = db.store.create_dataset("reef", None).await?;
//!     println!("Created dataset: {}", dataset.id);
//!     Ok(())
//! }
//! ```
pub mod classifiers;
pub mod datasets;
pub mod detections;
pub mod features;
pub mod file_storage;
pub mod jobs;
pub mod keywords;
pub mod memory;
pub mod patches;
pub mod pool;
pub mod rounds;
pub mod store;
pub mod test_fixtures;

// Re-export core types
pub use kaizen_core::*;

pub use file_storage::{encode_png, render_patch, FilesystemBlobStore};
pub use jobs::PgJobRepository;
pub use memory::{MemoryBlobStore, MemoryJobRepository, MemoryStore};
pub use pool::{create_pool_with_config, PoolConfig};
pub use store::PgStore;

/// Combined database context: the store and the queue over one pool.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Every store repository.
    pub store: PgStore,
    /// Job queue and barriers.
    pub jobs: PgJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            store: PgStore::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with a pool sized for the default worker.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
