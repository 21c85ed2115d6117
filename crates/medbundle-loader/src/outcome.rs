//! Per-record outcomes and the per-partition outcome uploader
//!
//! Every record a partition touches yields exactly one `Outcome`. Outcomes
//! serialize to newline-delimited JSON and accumulate in two independent
//! buffers (success and failure) that flush to the object store as
//! sequential multipart-upload parts. Aggregation is local to one
//! partition; nothing here is shared across partitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::PartitionError;
use crate::models::WorkItem;
use crate::object_store::{OutcomeStore, PartHandle};

/// Category of a failed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    Validation,
    TypeMismatch,
    Persistence,
}

/// Result of processing one record
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Created {
        resource_type: String,
        logical_id: String,
        line_number: i64,
        response_time_ms: i64,
    },
    Updated {
        resource_type: String,
        logical_id: String,
        line_number: i64,
        response_time_ms: i64,
    },
    /// Content unchanged; the write was skipped. Informational, not an error.
    Skipped {
        resource_type: String,
        logical_id: String,
        line_number: i64,
    },
    Failed {
        kind: FailureKind,
        resource_type: Option<String>,
        message: String,
        line_number: i64,
    },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn line_number(&self) -> i64 {
        match self {
            Outcome::Created { line_number, .. }
            | Outcome::Updated { line_number, .. }
            | Outcome::Skipped { line_number, .. }
            | Outcome::Failed { line_number, .. } => *line_number,
        }
    }

    /// The serialized NDJSON line shape
    pub fn to_record(&self) -> OutcomeRecord {
        match self {
            Outcome::Created {
                resource_type,
                logical_id,
                line_number,
                response_time_ms,
            } => OutcomeRecord {
                status: "created".to_string(),
                severity: "information".to_string(),
                resource_type: Some(resource_type.clone()),
                logical_id: Some(logical_id.clone()),
                line_number: *line_number,
                message: None,
                response_time_ms: Some(*response_time_ms),
            },
            Outcome::Updated {
                resource_type,
                logical_id,
                line_number,
                response_time_ms,
            } => OutcomeRecord {
                status: "updated".to_string(),
                severity: "information".to_string(),
                resource_type: Some(resource_type.clone()),
                logical_id: Some(logical_id.clone()),
                line_number: *line_number,
                message: None,
                response_time_ms: Some(*response_time_ms),
            },
            Outcome::Skipped {
                resource_type,
                logical_id,
                line_number,
            } => OutcomeRecord {
                status: "skipped".to_string(),
                severity: "information".to_string(),
                resource_type: Some(resource_type.clone()),
                logical_id: Some(logical_id.clone()),
                line_number: *line_number,
                message: Some("content unchanged, write skipped".to_string()),
                response_time_ms: None,
            },
            Outcome::Failed {
                kind,
                resource_type,
                message,
                line_number,
            } => OutcomeRecord {
                status: "failed".to_string(),
                severity: match kind {
                    FailureKind::TypeMismatch => "security".to_string(),
                    _ => "error".to_string(),
                },
                resource_type: resource_type.clone(),
                logical_id: None,
                line_number: *line_number,
                message: Some(message.clone()),
                response_time_ms: None,
            },
        }
    }
}

/// One line of an outcome stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub status: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
    pub line_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<i64>,
}

/// Upload bookkeeping for one stream, carried inside the checkpoint blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    pub upload_id: Option<String>,
    pub parts: Vec<PartHandle>,
}

/// Both streams' upload bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadSnapshot {
    pub success: StreamCheckpoint,
    pub failure: StreamCheckpoint,
}

struct OutcomeStream {
    key: String,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<PartHandle>,
}

impl OutcomeStream {
    fn new(key: String, checkpoint: StreamCheckpoint) -> Self {
        Self {
            key,
            buffer: Vec::new(),
            upload_id: checkpoint.upload_id,
            parts: checkpoint.parts,
        }
    }

    fn checkpoint(&self) -> StreamCheckpoint {
        StreamCheckpoint {
            upload_id: self.upload_id.clone(),
            parts: self.parts.clone(),
        }
    }
}

/// Buffers a partition's outcome streams and flushes them via multipart upload
pub struct OutcomeAggregator {
    store: Arc<dyn OutcomeStore>,
    bucket: String,
    flush_threshold: usize,
    success: OutcomeStream,
    failure: OutcomeStream,
}

impl OutcomeAggregator {
    /// Deterministic success-stream object name for a work item
    pub fn success_key(prefix: &str, item: &WorkItem) -> String {
        format!(
            "{}/{}-{}.success.ndjson",
            prefix.trim_end_matches('/'),
            item.id,
            item.object_name
        )
    }

    /// Deterministic failure-stream object name for a work item
    pub fn failure_key(prefix: &str, item: &WorkItem) -> String {
        format!(
            "{}/{}-{}.errors.ndjson",
            prefix.trim_end_matches('/'),
            item.id,
            item.object_name
        )
    }

    pub fn new(
        store: Arc<dyn OutcomeStore>,
        bucket: impl Into<String>,
        prefix: &str,
        item: &WorkItem,
        flush_threshold: usize,
    ) -> Self {
        Self::restore(store, bucket, prefix, item, flush_threshold, UploadSnapshot::default())
    }

    /// Rebuild the aggregator from checkpointed upload bookkeeping
    pub fn restore(
        store: Arc<dyn OutcomeStore>,
        bucket: impl Into<String>,
        prefix: &str,
        item: &WorkItem,
        flush_threshold: usize,
        snapshot: UploadSnapshot,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            flush_threshold,
            success: OutcomeStream::new(Self::success_key(prefix, item), snapshot.success),
            failure: OutcomeStream::new(Self::failure_key(prefix, item), snapshot.failure),
        }
    }

    /// Append one outcome to the matching stream, flushing on threshold
    pub async fn push(&mut self, outcome: &Outcome) -> Result<(), PartitionError> {
        let line = serde_json::to_vec(&outcome.to_record())
            .map_err(|e| PartitionError::ObjectStore(e.to_string()))?;

        let stream = if outcome.is_failure() {
            &mut self.failure
        } else {
            &mut self.success
        };
        stream.buffer.extend_from_slice(&line);
        stream.buffer.push(b'\n');

        if stream.buffer.len() >= self.flush_threshold {
            let which = if outcome.is_failure() { Which::Failure } else { Which::Success };
            self.flush_stream(which).await?;
        }

        Ok(())
    }

    /// Flush both streams' buffered bytes as their next upload parts
    pub async fn flush(&mut self) -> Result<(), PartitionError> {
        self.flush_stream(Which::Success).await?;
        self.flush_stream(Which::Failure).await?;
        Ok(())
    }

    /// Flush remaining bytes and finalize any open uploads
    ///
    /// A partition whose whole stream fit in one buffer gets the
    /// open-upload-finish sequence here.
    pub async fn finalize(&mut self) -> Result<(), PartitionError> {
        self.flush().await?;
        self.finish_stream(Which::Success).await?;
        self.finish_stream(Which::Failure).await?;
        Ok(())
    }

    /// Current upload bookkeeping, for the checkpoint blob
    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            success: self.success.checkpoint(),
            failure: self.failure.checkpoint(),
        }
    }

    pub fn buffered_success_bytes(&self) -> usize {
        self.success.buffer.len()
    }

    pub fn buffered_failure_bytes(&self) -> usize {
        self.failure.buffer.len()
    }

    async fn flush_stream(&mut self, which: Which) -> Result<(), PartitionError> {
        if self.stream(which).buffer.is_empty() {
            return Ok(());
        }

        let bucket = self.bucket.clone();
        let key = self.stream(which).key.clone();

        if self.stream(which).upload_id.is_none() {
            let upload_id = self
                .store
                .start_multipart_upload(&bucket, &key)
                .await
                .map_err(|e| PartitionError::ObjectStore(e.to_string()))?;
            self.stream_mut(which).upload_id = Some(upload_id);
        }

        let (bytes, part_number, upload_id) = {
            let stream = self.stream_mut(which);
            let bytes = std::mem::take(&mut stream.buffer);
            let part_number = stream.parts.len() as i32 + 1;
            let upload_id = stream.upload_id.clone().ok_or_else(|| {
                PartitionError::ObjectStore("upload id missing after open".into())
            })?;
            (bytes, part_number, upload_id)
        };

        debug!(key = %key, part_number, bytes = bytes.len(), "Flushing outcome part");

        let part = self
            .store
            .upload_part(&bucket, &key, &upload_id, part_number, bytes)
            .await
            .map_err(|e| PartitionError::ObjectStore(e.to_string()))?;

        self.stream_mut(which).parts.push(part);
        Ok(())
    }

    async fn finish_stream(&mut self, which: Which) -> Result<(), PartitionError> {
        let bucket = self.bucket.clone();
        let stream = self.stream_mut(which);
        let Some(upload_id) = stream.upload_id.take() else {
            return Ok(());
        };
        let key = stream.key.clone();
        let parts = std::mem::take(&mut stream.parts);

        self.store
            .finish_multipart_upload(&bucket, &key, &upload_id, parts)
            .await
            .map_err(|e| PartitionError::ObjectStore(e.to_string()))
    }

    fn stream(&self, which: Which) -> &OutcomeStream {
        match which {
            Which::Success => &self.success,
            Which::Failure => &self.failure,
        }
    }

    fn stream_mut(&mut self, which: Which) -> &mut OutcomeStream {
        match which {
            Which::Success => &mut self.success,
            Which::Failure => &mut self.failure,
        }
    }
}

#[derive(Clone, Copy)]
enum Which {
    Success,
    Failure,
}
