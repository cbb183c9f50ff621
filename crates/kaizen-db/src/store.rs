//! PostgreSQL store shared by the repository modules.
//!
//! Each repository trait is implemented for [`PgStore`] in its own module
//! (`datasets`, `patches`, `keywords`, ...), so one value satisfies the
//! `Store` super-trait the engine consumes.

use sqlx::{Pool, Postgres};

use kaizen_core::Error;

/// PostgreSQL implementation of every store repository.
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: Pool<Postgres>,
}

impl PgStore {
    /// Create a new PgStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Map a write failure onto the domain error taxonomy.
///
/// Unique violations become `Conflict` (a concurrent writer won), foreign-key
/// violations become `NotFound` (the parent row is missing or not yet
/// visible). Everything else stays a database error.
pub(crate) fn write_err(e: sqlx::Error, what: &str) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::Conflict(format!("{}: {}", what, db.message()));
        }
        if db.is_foreign_key_violation() {
            return Error::NotFound(format!("{}: {}", what, db.message()));
        }
    }
    Error::Database(e)
}

pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{} {}", what, id))
}
