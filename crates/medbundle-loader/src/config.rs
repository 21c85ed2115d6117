//! Loader configuration
//!
//! Env-driven, one `from_env` entry point like the rest of the workspace.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

use crate::models::{FileType, PathFilter};
use crate::object_store::StorageConfig;

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Postgres connection string for the allocation store
    pub database_url: String,
    /// Object store connection settings
    pub storage: StorageConfig,
    /// Bucket receiving outcome streams
    pub outcome_bucket: String,
    /// Key prefix for outcome objects
    pub outcome_prefix: String,
    /// Bundle shape this worker processes
    pub file_type: FileType,
    /// Records read per batch
    pub batch_size: usize,
    /// Outcome buffer bytes before a part is flushed
    pub flush_threshold: usize,
    /// Partitions processed concurrently by this worker
    pub max_partitions: usize,
    /// Seconds between allocation polls when no work is available
    pub poll_interval_secs: u64,
    /// Seconds between instance heartbeats
    pub heartbeat_interval_secs: u64,
    /// Whether unchanged-content writes are skipped
    pub skip_enabled: bool,
    /// Record count between throughput samples
    pub metrics_sample_interval: u64,
    /// Optional bucket/path-prefix restrictions on claimable work
    pub path_filters: Vec<PathFilter>,
}

impl LoaderConfig {
    /// Load configuration from environment variables
    ///
    /// `DATABASE_URL` is required; everything else has a default. Path
    /// filters use `LOADER_PATH_FILTERS=bucket:prefix[,bucket:prefix...]`.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            storage: StorageConfig::from_env()?,
            outcome_bucket: env::var("LOADER_OUTCOME_BUCKET")
                .unwrap_or_else(|_| "medbundle-outcomes".to_string()),
            outcome_prefix: env::var("LOADER_OUTCOME_PREFIX")
                .unwrap_or_else(|_| "outcomes".to_string()),
            file_type: env::var("LOADER_FILE_TYPE")
                .map(FileType::from)
                .unwrap_or(FileType::NdJson),
            batch_size: env_parse("LOADER_BATCH_SIZE", 1000)?,
            // The S3 minimum part size; smaller parts fail on finalize.
            flush_threshold: env_parse("LOADER_FLUSH_THRESHOLD_BYTES", 5 * 1024 * 1024)?,
            max_partitions: env_parse("LOADER_MAX_PARTITIONS", 4)?,
            poll_interval_secs: env_parse("LOADER_POLL_INTERVAL_SECS", 10)?,
            heartbeat_interval_secs: env_parse("LOADER_HEARTBEAT_INTERVAL_SECS", 30)?,
            skip_enabled: env_parse("LOADER_SKIP_UNCHANGED", true)?,
            metrics_sample_interval: env_parse("LOADER_METRICS_SAMPLE_INTERVAL", 1000)?,
            path_filters: parse_path_filters(
                &env::var("LOADER_PATH_FILTERS").unwrap_or_default(),
            )?,
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

/// Parse `bucket:prefix[,bucket:prefix...]`; an empty string means no filter
fn parse_path_filters(raw: &str) -> Result<Vec<PathFilter>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (bucket, prefix) = entry
                .split_once(':')
                .with_context(|| format!("Invalid path filter '{}', expected bucket:prefix", entry))?;
            Ok(PathFilter::new(bucket, prefix))
        })
        .collect()
}
