//! Idempotent record writes
//!
//! Decides per record whether to create, update, or skip, and emits a tagged
//! `Outcome` instead of raising: the partition loop's continuation logic
//! stays visible in the type. A skip means the stored content fingerprint
//! equals the candidate's; no generation bump happens and the outcome is
//! informational.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use medbundle_common::fingerprint::content_fingerprint;

use crate::allocation::AllocationStore;
use crate::models::LogicalResourceRecord;
use crate::outcome::{FailureKind, Outcome};
use crate::source::{PersistenceCapability, SourceRecord, StoredRecord};

/// What to do with a record that carries an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteDecision {
    Update { generation: i32 },
    Skip,
}

/// Writes one partition's records through the persistence capability
pub struct IdempotentWriter {
    persistence: Arc<dyn PersistenceCapability>,
    store: Arc<dyn AllocationStore>,
    expected_type: String,
    work_item_id: i64,
    allocation_id: i64,
}

impl IdempotentWriter {
    pub fn new(
        persistence: Arc<dyn PersistenceCapability>,
        store: Arc<dyn AllocationStore>,
        expected_type: impl Into<String>,
        work_item_id: i64,
        allocation_id: i64,
    ) -> Self {
        Self {
            persistence,
            store,
            expected_type: expected_type.into(),
            work_item_id,
            allocation_id,
        }
    }

    /// Write one record, producing exactly one Outcome
    ///
    /// Persistence faults become failed outcomes counted by the caller; they
    /// never abort the partition.
    pub async fn write_record(&self, record: &SourceRecord, skip_enabled: bool) -> Outcome {
        if record.resource_type != self.expected_type {
            return Outcome::Failed {
                kind: FailureKind::TypeMismatch,
                resource_type: Some(record.resource_type.clone()),
                message: format!(
                    "declared type {} does not match partition type {}",
                    record.resource_type, self.expected_type
                ),
                line_number: record.line_number,
            };
        }

        let now = Utc::now();

        let Some(logical_id) = record.logical_id.clone() else {
            // No assigned identity: always a create under a fresh id.
            let logical_id = self.persistence.generate_id();
            let body = inject_meta(&record.body, 1, now);

            let started = Instant::now();
            if let Err(e) = self
                .persistence
                .create(&record.resource_type, &logical_id, &body)
                .await
            {
                return self.persistence_failure(record, e.to_string());
            }
            let response_time_ms = started.elapsed().as_millis() as i64;

            self.append_audit(record, &logical_id, response_time_ms).await;

            return Outcome::Created {
                resource_type: record.resource_type.clone(),
                logical_id,
                line_number: record.line_number,
                response_time_ms,
            };
        };

        let stored = match self
            .persistence
            .read(&record.resource_type, &logical_id)
            .await
        {
            Ok(stored) => stored,
            Err(e) => return self.persistence_failure(record, e.to_string()),
        };

        match decide(stored.as_ref(), &record.body, skip_enabled, now) {
            WriteDecision::Skip => {
                debug!(
                    resource_type = %record.resource_type,
                    logical_id = %logical_id,
                    line_number = record.line_number,
                    "Content unchanged, skipping write"
                );
                Outcome::Skipped {
                    resource_type: record.resource_type.clone(),
                    logical_id,
                    line_number: record.line_number,
                }
            },
            WriteDecision::Update { generation } => {
                let body = inject_meta(&record.body, generation, now);

                let started = Instant::now();
                if let Err(e) = self
                    .persistence
                    .update(&record.resource_type, &logical_id, &body, generation)
                    .await
                {
                    return self.persistence_failure(record, e.to_string());
                }
                let response_time_ms = started.elapsed().as_millis() as i64;

                self.append_audit(record, &logical_id, response_time_ms).await;

                Outcome::Updated {
                    resource_type: record.resource_type.clone(),
                    logical_id,
                    line_number: record.line_number,
                    response_time_ms,
                }
            },
        }
    }

    fn persistence_failure(&self, record: &SourceRecord, message: String) -> Outcome {
        Outcome::Failed {
            kind: FailureKind::Persistence,
            resource_type: Some(record.resource_type.clone()),
            message,
            line_number: record.line_number,
        }
    }

    /// Append the audit entry for a successful create/update. A duplicate
    /// key means a prior attempt already recorded this line; log and move on.
    async fn append_audit(&self, record: &SourceRecord, logical_id: &str, response_time_ms: i64) {
        let entry = LogicalResourceRecord {
            resource_type: record.resource_type.clone(),
            logical_id: logical_id.to_string(),
            work_item_id: self.work_item_id,
            allocation_id: self.allocation_id,
            line_number: record.line_number,
            response_time_ms: Some(response_time_ms),
        };

        match self.store.append_resource_record(&entry).await {
            Ok(true) => {},
            Ok(false) => {
                warn!(
                    resource_type = %entry.resource_type,
                    logical_id = %entry.logical_id,
                    line_number = entry.line_number,
                    "Logical resource already recorded by a prior attempt"
                );
            },
            Err(e) => {
                warn!(
                    resource_type = %entry.resource_type,
                    logical_id = %entry.logical_id,
                    error = %e,
                    "Could not append logical resource record"
                );
            },
        }
    }
}

/// Choose between update and skip for an identified record
fn decide(
    stored: Option<&StoredRecord>,
    candidate: &Value,
    skip_enabled: bool,
    now: DateTime<Utc>,
) -> WriteDecision {
    let Some(stored) = stored else {
        return WriteDecision::Update { generation: 1 };
    };

    if stored.deleted || !skip_enabled {
        return WriteDecision::Update {
            generation: stored.generation + 1,
        };
    }

    // Compare the stored content against the candidate as it would be
    // stored, post meta injection. The fingerprint ignores the volatile
    // meta fields, so only real content differences register.
    let as_stored = inject_meta(candidate, stored.generation + 1, now);
    if content_fingerprint(&stored.body) == content_fingerprint(&as_stored) {
        WriteDecision::Skip
    } else {
        WriteDecision::Update {
            generation: stored.generation + 1,
        }
    }
}

/// Stamp the server-maintained meta fields onto a record body
pub(crate) fn inject_meta(body: &Value, generation: i32, timestamp: DateTime<Utc>) -> Value {
    let mut body = body.clone();

    if !body.is_object() {
        return body;
    }

    let meta = body
        .as_object_mut()
        .and_then(|map| {
            if !map.contains_key("meta") {
                map.insert("meta".to_string(), Value::Object(Default::default()));
            }
            map.get_mut("meta")
        })
        .and_then(Value::as_object_mut);

    if let Some(meta) = meta {
        meta.insert("versionId".to_string(), Value::String(generation.to_string()));
        meta.insert(
            "lastUpdated".to_string(),
            Value::String(timestamp.to_rfc3339()),
        );
    }

    body
}
