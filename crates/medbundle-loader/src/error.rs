//! Error taxonomy for the loader
//!
//! Three tiers: coordination faults (`AllocationError`, retryable by the
//! caller), record-level faults (`WriteError`, counted and folded into a
//! failure outcome, never aborting a partition), and partition-fatal faults
//! (`PartitionError`, aborting the partition while leaving the allocation
//! and checkpoint in place for reclaim).

use thiserror::Error;

/// Coordination fault against the allocation store. Always retryable; the
/// single-statement claim leaves no partial state behind.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Allocation store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Allocation store returned an inconsistent row: {0}")]
    InconsistentRow(String),
}

/// Per-record persistence fault. Counted toward the partition failure
/// counter; the partition continues.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Persistence call failed: {0}")]
    Persistence(String),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fault while reading from the record source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Record source unavailable: {0}")]
    Unavailable(String),

    #[error("Record source read failed: {0}")]
    Read(String),
}

/// Partition-fatal fault. The partition aborts, the WorkItem keeps its
/// allocation, and checkpoint state stays durable up to the last flushed
/// batch.
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Object store operation failed: {0}")]
    ObjectStore(String),

    #[error("Coordination store failure: {0}")]
    Store(#[from] AllocationError),

    #[error(transparent)]
    Source(#[from] SourceError),
}
