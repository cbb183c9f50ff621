//! Runtime configuration.
//!
//! A single `KaizenConfig` value is built once (usually from the environment)
//! and handed to each component's constructor. Nothing reads the environment
//! after startup.

use std::path::PathBuf;

use crate::defaults;

/// Configuration for the engine, extractors, storage and worker.
#[derive(Debug, Clone)]
pub struct KaizenConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Directory source images are resolved against.
    pub blob_dir: PathBuf,
    /// Directory materialized crops are cached in.
    pub cache_dir: PathBuf,
    /// Directory holding `<model>/model.json` network definitions.
    pub models_dir: PathBuf,
    /// Queries chosen per round.
    pub query_num: usize,
    /// Estimator decision threshold.
    pub threshold: f32,
    /// Linear SVM regularization strength.
    pub svm_c: f32,
    /// Largest batch a network is built for.
    pub cnn_max_batch: usize,
    /// Seed rows between extractor resource releases.
    pub release_interval: usize,
    /// Seconds between a failure and its retry.
    pub retry_delay_secs: u64,
    /// Attempt ceiling; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Concurrent jobs per worker.
    pub max_concurrent_jobs: usize,
    /// Poll interval when the queue is empty.
    pub poll_interval_ms: u64,
    /// Whether the worker processes jobs at all.
    pub worker_enabled: bool,
}

impl Default for KaizenConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            blob_dir: PathBuf::from(defaults::BLOB_DIR),
            cache_dir: PathBuf::from(defaults::CACHE_DIR),
            models_dir: PathBuf::from(defaults::MODELS_DIR),
            query_num: defaults::QUERY_NUM,
            threshold: defaults::THRESHOLD,
            svm_c: defaults::SVM_C,
            cnn_max_batch: defaults::CNN_MAX_BATCH,
            release_interval: defaults::RELEASE_INTERVAL,
            retry_delay_secs: defaults::JOB_RETRY_DELAY_SECS,
            max_attempts: Some(defaults::JOB_MAX_ATTEMPTS),
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            worker_enabled: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl KaizenConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_URL` | local `kaizen` db | PostgreSQL connection string |
    /// | `KAIZEN_BLOB_DIR` | `static/blobs` | Source image root |
    /// | `KAIZEN_CACHE_DIR` | `static/cache` | Crop cache root |
    /// | `KAIZEN_MODELS_DIR` | `models` | Network definitions |
    /// | `KAIZEN_QUERY_NUM` | `200` | Queries per round |
    /// | `KAIZEN_THRESHOLD` | `-1.0` | Decision threshold |
    /// | `KAIZEN_SVM_C` | `1.0` | SVM regularization |
    /// | `KAIZEN_CNN_MAX_BATCH` | `500` | Network batch ceiling |
    /// | `KAIZEN_RELEASE_INTERVAL` | `1000` | Rows between extractor releases |
    /// | `JOB_RETRY_DELAY_SECS` | `30` | Retry delay |
    /// | `JOB_MAX_ATTEMPTS` | `10` | Attempt ceiling, `0` = unbounded |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    pub fn from_env() -> Self {
        let base = Self::default();

        let max_attempts = match env_parse::<u32>("JOB_MAX_ATTEMPTS") {
            Some(0) => None,
            Some(n) => Some(n),
            None => base.max_attempts,
        };

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(base.database_url),
            blob_dir: std::env::var("KAIZEN_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.blob_dir),
            cache_dir: std::env::var("KAIZEN_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.cache_dir),
            models_dir: std::env::var("KAIZEN_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.models_dir),
            query_num: env_parse("KAIZEN_QUERY_NUM").unwrap_or(base.query_num),
            threshold: env_parse("KAIZEN_THRESHOLD").unwrap_or(base.threshold),
            svm_c: env_parse("KAIZEN_SVM_C").unwrap_or(base.svm_c),
            cnn_max_batch: env_parse::<usize>("KAIZEN_CNN_MAX_BATCH")
                .unwrap_or(base.cnn_max_batch)
                .max(1),
            release_interval: env_parse::<usize>("KAIZEN_RELEASE_INTERVAL")
                .unwrap_or(base.release_interval)
                .max(1),
            retry_delay_secs: env_parse("JOB_RETRY_DELAY_SECS").unwrap_or(base.retry_delay_secs),
            max_attempts,
            max_concurrent_jobs: env_parse::<usize>("JOB_MAX_CONCURRENT")
                .unwrap_or(base.max_concurrent_jobs)
                .max(1),
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS").unwrap_or(base.poll_interval_ms),
            worker_enabled: std::env::var("JOB_WORKER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(base.worker_enabled),
        }
    }

    /// Set the number of queries chosen per round.
    pub fn with_query_num(mut self, n: usize) -> Self {
        self.query_num = n;
        self
    }

    /// Set the decision threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the SVM regularization strength.
    pub fn with_svm_c(mut self, c: f32) -> Self {
        self.svm_c = c;
        self
    }

    /// Set the network batch ceiling.
    pub fn with_cnn_max_batch(mut self, n: usize) -> Self {
        self.cnn_max_batch = n.max(1);
        self
    }

    /// Set the extractor release interval.
    pub fn with_release_interval(mut self, n: usize) -> Self {
        self.release_interval = n.max(1);
        self
    }

    /// Set the blob root.
    pub fn with_blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_dir = dir.into();
        self
    }

    /// Set the crop cache root.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the models root.
    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    /// Set the attempt ceiling (`None` = unbounded).
    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = KaizenConfig::default();
        assert_eq!(config.query_num, 200);
        assert_eq!(config.threshold, -1.0);
        assert_eq!(config.svm_c, 1.0);
        assert_eq!(config.cnn_max_batch, 500);
        assert_eq!(config.release_interval, 1000);
        assert_eq!(config.retry_delay_secs, 30);
        assert_eq!(config.max_attempts, Some(10));
        assert!(config.worker_enabled);
    }

    #[test]
    fn test_config_builder_chaining() {
        let config = KaizenConfig::default()
            .with_query_num(1)
            .with_threshold(0.0)
            .with_cnn_max_batch(0)
            .with_max_attempts(None);

        assert_eq!(config.query_num, 1);
        assert_eq!(config.threshold, 0.0);
        // Batch size is clamped so the batching plan never divides by zero
        assert_eq!(config.cnn_max_batch, 1);
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn test_config_debug() {
        let debug_str = format!("{:?}", KaizenConfig::default());
        assert!(debug_str.contains("KaizenConfig"));
        assert!(debug_str.contains("query_num"));
    }
}
