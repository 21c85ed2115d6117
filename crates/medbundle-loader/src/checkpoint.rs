//! Per-partition checkpointing
//!
//! A partition moves `Fresh -> Active -> Checkpointed -> (Active | Completed
//! | Failed)`. The checkpoint records how many source lines have been
//! durably committed; a restarted worker resumes from that skip count. A
//! crash after records were persisted but before the checkpoint landed
//! redelivers at most one batch, which the idempotent writer turns into
//! no-ops or safe overwrites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::allocation::AllocationStore;
use crate::error::AllocationError;
use crate::models::AllocatedItem;
use crate::outcome::UploadSnapshot;

/// Partition lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPhase {
    Fresh,
    Active,
    Checkpointed,
    Completed,
    Failed,
}

impl PartitionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionPhase::Completed | PartitionPhase::Failed)
    }
}

/// The serialized checkpoint blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Source lines durably committed; reads resume after this many
    pub skip_count: i64,
    /// WorkItem byte size, fetched once for progress reporting
    pub total_bytes: i64,
    /// Multipart-upload bookkeeping for both outcome streams
    pub uploads: UploadSnapshot,
    /// Accumulated time spent reading batches
    pub read_elapsed_ms: i64,
    /// Accumulated time spent validating and writing
    pub process_elapsed_ms: i64,
    pub last_committed_at: Option<DateTime<Utc>>,
}

impl CheckpointState {
    fn fresh(total_bytes: i64) -> Self {
        Self {
            skip_count: 0,
            total_bytes,
            uploads: UploadSnapshot::default(),
            read_elapsed_ms: 0,
            process_elapsed_ms: 0,
            last_committed_at: None,
        }
    }
}

/// Owns one partition's checkpoint state and its persistence
///
/// Owned exclusively by the partition task; never shared across partitions.
pub struct CheckpointManager {
    store: Arc<dyn AllocationStore>,
    load_attempt_id: i64,
    state: CheckpointState,
    phase: PartitionPhase,
}

impl CheckpointManager {
    /// Restore the newest persisted checkpoint for the work item, or start
    /// fresh when none exists
    pub async fn begin(
        store: Arc<dyn AllocationStore>,
        allocated: &AllocatedItem,
    ) -> Result<Self, AllocationError> {
        let work_item_id = allocated.item.id;

        let (state, phase) = match store.load_checkpoint(work_item_id).await? {
            Some(blob) => match serde_json::from_value::<CheckpointState>(blob) {
                Ok(state) => {
                    info!(
                        work_item_id,
                        skip_count = state.skip_count,
                        "Resuming partition from checkpoint"
                    );
                    (state, PartitionPhase::Active)
                },
                Err(e) => {
                    warn!(
                        work_item_id,
                        error = %e,
                        "Discarding unreadable checkpoint blob, starting fresh"
                    );
                    let total_bytes = store.work_item_size(work_item_id).await?;
                    (CheckpointState::fresh(total_bytes), PartitionPhase::Fresh)
                },
            },
            None => {
                let total_bytes = store.work_item_size(work_item_id).await?;
                (CheckpointState::fresh(total_bytes), PartitionPhase::Fresh)
            },
        };

        Ok(Self {
            store,
            load_attempt_id: allocated.load_attempt_id,
            state,
            phase,
        })
    }

    /// Lines already committed; the next read starts after this many
    pub fn skip_count(&self) -> i64 {
        self.state.skip_count
    }

    pub fn phase(&self) -> PartitionPhase {
        self.phase
    }

    pub fn total_bytes(&self) -> i64 {
        self.state.total_bytes
    }

    pub fn uploads(&self) -> UploadSnapshot {
        self.state.uploads.clone()
    }

    /// Transition into Active ahead of a batch read
    pub fn begin_batch(&mut self) {
        debug_assert!(!self.phase.is_terminal(), "batch after terminal phase");
        self.phase = PartitionPhase::Active;
    }

    /// Advance the skip count after a batch's outcomes are durable and
    /// persist the blob. Records that failed record-level validation count
    /// as consumed; the skip count only ever moves forward.
    pub async fn commit(
        &mut self,
        consumed: usize,
        uploads: UploadSnapshot,
        read_elapsed_ms: i64,
        process_elapsed_ms: i64,
    ) -> Result<(), AllocationError> {
        debug_assert!(!self.phase.is_terminal(), "commit after terminal phase");

        self.state.skip_count += consumed as i64;
        self.state.uploads = uploads;
        self.state.read_elapsed_ms += read_elapsed_ms;
        self.state.process_elapsed_ms += process_elapsed_ms;
        self.state.last_committed_at = Some(Utc::now());

        self.persist().await?;
        self.phase = PartitionPhase::Checkpointed;

        debug!(
            load_attempt_id = self.load_attempt_id,
            skip_count = self.state.skip_count,
            "Checkpoint committed"
        );

        Ok(())
    }

    /// Terminal transition when the record source is exhausted
    pub async fn complete(&mut self) -> Result<(), AllocationError> {
        self.phase = PartitionPhase::Completed;
        self.persist().await
    }

    /// Terminal transition on an unrecoverable fault. Best effort: the
    /// checkpoint from the last successful commit is already durable.
    pub async fn fail(&mut self) {
        self.phase = PartitionPhase::Failed;
        if let Err(e) = self.persist().await {
            warn!(
                load_attempt_id = self.load_attempt_id,
                error = %e,
                "Could not persist checkpoint during partition failure"
            );
        }
    }

    async fn persist(&self) -> Result<(), AllocationError> {
        let blob = serde_json::to_value(&self.state).map_err(|e| {
            AllocationError::InconsistentRow(format!("checkpoint serialization: {}", e))
        })?;
        self.store.save_checkpoint(self.load_attempt_id, &blob).await
    }
}
