//! Core types for the distributed bundle loader

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shape of a bundle file in the object store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Newline-delimited records, one resource per line
    NdJson,
    /// A single JSON resource per file
    Bundle,
}

impl FileType {
    pub fn as_str(&self) -> &str {
        match self {
            FileType::NdJson => "ndjson",
            FileType::Bundle => "bundle",
        }
    }
}

impl From<String> for FileType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "bundle" => FileType::Bundle,
            _ => FileType::NdJson,
        }
    }
}

/// Loader instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Active,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Active => "active",
            InstanceStatus::Stopped => "stopped",
        }
    }
}

impl From<String> for InstanceStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => InstanceStatus::Active,
            "stopped" => InstanceStatus::Stopped,
            _ => InstanceStatus::Starting,
        }
    }
}

/// One bundle file awaiting or undergoing ingestion (maps to work_items)
///
/// allocation_id and loader_instance_id are both null or both set; only the
/// single-statement claim in the allocation store ever writes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub bucket: String,
    pub object_path: String,
    pub object_name: String,
    pub size_bytes: i64,
    pub file_type: FileType,
    /// Content tag from the object store (etag or hash)
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Mutation generation, incremented whenever the source file changes
    pub version: i32,
    pub allocation_id: Option<i64>,
    pub loader_instance_id: Option<Uuid>,
}

impl WorkItem {
    /// Resource type encoded in the object name (`<Type>.ndjson` convention)
    pub fn resource_type(&self) -> &str {
        self.object_name
            .split('.')
            .next()
            .unwrap_or(&self.object_name)
    }
}

/// One running worker process (maps to loader_instances)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderInstance {
    pub id: Uuid,
    pub hostname: String,
    pub pid: i32,
    pub heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl LoaderInstance {
    /// Build the registration row for this process
    pub fn for_current_process() -> Self {
        Self {
            id: Uuid::new_v4(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            pid: std::process::id() as i32,
            heartbeat: Utc::now(),
            status: InstanceStatus::Starting,
        }
    }
}

/// One attempt to process a WorkItem under one allocation run
/// (maps to load_attempts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadAttempt {
    pub id: i64,
    pub work_item_id: i64,
    pub allocation_id: i64,
    pub loader_instance_id: Uuid,
    /// WorkItem version captured when the attempt started
    pub item_version: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_processed: Option<i64>,
    pub failure_count: Option<i64>,
}

/// A claimed WorkItem paired with its LoadAttempt, as returned by allocation
#[derive(Debug, Clone)]
pub struct AllocatedItem {
    pub item: WorkItem,
    pub load_attempt_id: i64,
}

/// Bucket + path-prefix pair restricting which WorkItems may be claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFilter {
    pub bucket: String,
    pub path_prefix: String,
}

impl PathFilter {
    pub fn new(bucket: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path_prefix: path_prefix.into(),
        }
    }
}

/// Audit entry recording what one source line produced
/// (maps to logical_resource_records, unique per (resource_type, logical_id))
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalResourceRecord {
    pub resource_type: String,
    pub logical_id: String,
    pub work_item_id: i64,
    pub allocation_id: i64,
    pub line_number: i64,
    pub response_time_ms: Option<i64>,
}
