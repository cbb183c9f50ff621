//! Connection pool sized for the job worker.
//!
//! A running task holds a connection for its store writes and may need a
//! second one while its job is settled, and the claim loop polls on its
//! own. The pool therefore grows with the worker's concurrency.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use kaizen_core::{defaults, Error, Result};

/// Smallest pool handed out, whatever the concurrency.
const MIN_POOL_SIZE: u32 = 10;

/// Connections per concurrently running task.
const CONNECTIONS_PER_TASK: u32 = 2;

/// Connections for the claim loop and the command line.
const RESERVED_CONNECTIONS: u32 = 2;

/// How long a task waits for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_workers(defaults::JOB_MAX_CONCURRENT)
    }
}

impl PoolConfig {
    /// Size the pool for a worker running `jobs` tasks at once.
    pub fn for_workers(jobs: usize) -> Self {
        let jobs = u32::try_from(jobs).unwrap_or(u32::MAX);
        let wanted = jobs
            .saturating_mul(CONNECTIONS_PER_TASK)
            .saturating_add(RESERVED_CONNECTIONS);
        Self {
            max_connections: wanted.max(MIN_POOL_SIZE),
            acquire_timeout: ACQUIRE_TIMEOUT,
        }
    }

    /// Cap the pool at `n` connections.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }
}

/// Connect a pool with the given sizing.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}
