//! Medbundle Loader
//!
//! Distributed bulk ingestion of clinical record bundles. Worker processes
//! coordinate exclusively through the shared allocation store: each claims a
//! batch of unclaimed bundle files, streams their records into the
//! persistence backend in checkpointed batches, skips writes whose content
//! fingerprint is unchanged, and pushes per-record outcome streams to the
//! object store via multipart upload.
//!
//! The public surface is the internal API a job-orchestration layer
//! consumes: construct a [`worker::LoaderWorker`] with the production
//! collaborators (or drive [`partition::PartitionProcessor`] directly for a
//! single item) and call `run`.

pub mod allocation;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod object_store;
pub mod outcome;
pub mod partition;
pub mod source;
pub mod worker;
pub mod writer;

pub use allocation::{AllocationCoordinator, AllocationStore};
pub use config::LoaderConfig;
pub use models::{AllocatedItem, FileType, PathFilter, WorkItem};
pub use outcome::Outcome;
pub use worker::LoaderWorker;
