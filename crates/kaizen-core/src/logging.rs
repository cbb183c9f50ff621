//! Structured logging schema and field name constants for kaizen.
//!
//! All crates use these constants for consistent structured logging fields.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Soft failure or retry scheduled, sibling work unaffected |
//! | INFO  | Lifecycle events, round transitions, task completions |
//! | DEBUG | Decision points (fallback negatives, batch plans, cache misses) |
//! | TRACE | Per-item iteration (per patch, per prediction) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "features", "learn", "jobs", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "worker", "round_engine", "cnn", "feature_cache"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "initialize", "predict", "advance", "extract_many"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

pub const DATASET_ID: &str = "dataset_id";
pub const BLOB_ID: &str = "blob_id";
pub const PATCH_ID: &str = "patch_id";
pub const KEYWORD_ID: &str = "keyword_id";
pub const CLASSIFIER_ID: &str = "classifier_id";
pub const ROUND_ID: &str = "round_id";

/// Round number within its classifier.
pub const ROUND_NUMBER: &str = "round";

/// FeatureSpec id.
pub const SPEC_ID: &str = "spec_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Task name of a job.
pub const TASK: &str = "task";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of examples a round trains on.
pub const EXAMPLE_COUNT: &str = "example_count";

/// Number of predictions persisted.
pub const PREDICTION_COUNT: &str = "prediction_count";

/// Number of queries chosen.
pub const QUERY_COUNT: &str = "query_count";

/// Batch dimension a network was built for.
pub const BATCH_SIZE: &str = "batch_size";

/// Attempt number of a job.
pub const ATTEMPT: &str = "attempt";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
