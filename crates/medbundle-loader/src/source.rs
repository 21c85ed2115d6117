//! Contracts for the loader's external collaborators
//!
//! The record source, validation engine, and persistence backend are not
//! implemented here; the partition processor and idempotent writer consume
//! them through these seams. Production wiring supplies the real providers,
//! tests supply in-memory fakes.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SourceError, WriteError};
use crate::models::WorkItem;

/// One record read from a bundle file
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Declared resource type of the record body
    pub resource_type: String,
    /// Assigned identity, if the record carries one
    pub logical_id: Option<String>,
    pub body: Value,
    /// 1-based line number within the bundle
    pub line_number: i64,
}

/// One item from a batch read: a parsed record or a line that failed to parse
#[derive(Debug, Clone)]
pub enum SourceItem {
    Record(SourceRecord),
    ParseFailure { line_number: i64, message: String },
}

/// Streaming reader over one bundle file
///
/// `read_batch(skip, max)` returns up to `max` items starting after the
/// first `skip` lines. An empty batch means the source is exhausted.
/// Items arrive in strict source order.
#[async_trait]
pub trait RecordSource: Send {
    async fn size(&self) -> Result<i64, SourceError>;

    async fn read_batch(&mut self, skip: i64, max: usize) -> Result<Vec<SourceItem>, SourceError>;

    /// Running count of lines that failed to parse
    fn parse_failures(&self) -> i64;

    /// Running count of records successfully yielded
    fn records_loaded(&self) -> i64;
}

/// Opens a RecordSource for a claimed WorkItem
#[async_trait]
pub trait RecordSourceFactory: Send + Sync {
    async fn open(&self, item: &WorkItem) -> Result<Box<dyn RecordSource>, SourceError>;
}

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Information,
    Warning,
    Error,
}

/// One finding from the validation engine
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub detail: String,
}

impl Issue {
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            detail: detail.into(),
        }
    }
}

/// Structural validation of a record body before persistence
pub trait Validator: Send + Sync {
    fn validate(&self, body: &Value) -> Vec<Issue>;
}

/// A record as currently held by the persistence backend
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub body: Value,
    pub generation: i32,
    pub deleted: bool,
}

/// Single-record persistence backend
#[async_trait]
pub trait PersistenceCapability: Send + Sync {
    /// Store a new record under a freshly assigned identity
    async fn create(
        &self,
        resource_type: &str,
        logical_id: &str,
        body: &Value,
    ) -> Result<(), WriteError>;

    /// Fetch the currently stored record, including logically-deleted markers
    async fn read(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<StoredRecord>, WriteError>;

    /// Replace the stored record at the given generation
    async fn update(
        &self,
        resource_type: &str,
        logical_id: &str,
        body: &Value,
        generation: i32,
    ) -> Result<(), WriteError>;

    /// Mint a new logical identity
    fn generate_id(&self) -> String;
}
