//! Partition processing
//!
//! One partition is one claimed WorkItem handled by one task: read a batch,
//! validate, write idempotently, buffer outcomes, then flush and checkpoint
//! at the chunk boundary. Record-level faults are counted and the loop
//! continues; object-store or checkpoint faults abort the partition with
//! the allocation left in place for reclaim.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::allocation::AllocationStore;
use crate::checkpoint::CheckpointManager;
use crate::config::LoaderConfig;
use crate::error::{AllocationError, PartitionError};
use crate::metrics::MetricsCollector;
use crate::models::AllocatedItem;
use crate::object_store::OutcomeStore;
use crate::outcome::{FailureKind, Outcome, OutcomeAggregator};
use crate::source::{IssueSeverity, PersistenceCapability, RecordSource, SourceItem, Validator};
use crate::writer::IdempotentWriter;

/// Per-partition settings, cut down from the worker config
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub batch_size: usize,
    pub flush_threshold: usize,
    pub skip_enabled: bool,
    pub outcome_bucket: String,
    pub outcome_prefix: String,
}

impl From<&LoaderConfig> for PartitionConfig {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_threshold: config.flush_threshold,
            skip_enabled: config.skip_enabled,
            outcome_bucket: config.outcome_bucket.clone(),
            outcome_prefix: config.outcome_prefix.clone(),
        }
    }
}

/// Final accounting for one partition run
#[derive(Debug, Clone, Default)]
pub struct PartitionSummary {
    pub work_item_id: i64,
    pub rows_processed: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
    /// True when the partition stopped on a shutdown signal and stays
    /// resumable under its current allocation
    pub cancelled: bool,
    pub duration_secs: f64,
}

/// Processes one claimed WorkItem to completion, cancellation, or failure
pub struct PartitionProcessor {
    store: Arc<dyn AllocationStore>,
    outcome_store: Arc<dyn OutcomeStore>,
    persistence: Arc<dyn PersistenceCapability>,
    validator: Arc<dyn Validator>,
    metrics: Arc<MetricsCollector>,
    config: PartitionConfig,
    cancel: CancellationToken,
}

impl PartitionProcessor {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        outcome_store: Arc<dyn OutcomeStore>,
        persistence: Arc<dyn PersistenceCapability>,
        validator: Arc<dyn Validator>,
        metrics: Arc<MetricsCollector>,
        config: PartitionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            outcome_store,
            persistence,
            validator,
            metrics,
            config,
            cancel,
        }
    }

    #[instrument(skip_all, fields(work_item_id = allocated.item.id))]
    pub async fn run(
        &self,
        allocated: &AllocatedItem,
        source: &mut dyn RecordSource,
    ) -> Result<PartitionSummary, PartitionError> {
        let started = Instant::now();

        let allocation_id = allocated.item.allocation_id.ok_or_else(|| {
            PartitionError::Store(AllocationError::InconsistentRow(
                "claimed work item has no allocation id".to_string(),
            ))
        })?;
        let expected_type = allocated.item.resource_type().to_string();

        let mut checkpoint = CheckpointManager::begin(self.store.clone(), allocated).await?;
        let mut aggregator = OutcomeAggregator::restore(
            self.outcome_store.clone(),
            self.config.outcome_bucket.clone(),
            &self.config.outcome_prefix,
            &allocated.item,
            self.config.flush_threshold,
            checkpoint.uploads(),
        );
        let writer = IdempotentWriter::new(
            self.persistence.clone(),
            self.store.clone(),
            expected_type.clone(),
            allocated.item.id,
            allocation_id,
        );

        let mut summary = PartitionSummary {
            work_item_id: allocated.item.id,
            ..Default::default()
        };

        let outcome = self
            .run_loop(
                &mut checkpoint,
                &mut aggregator,
                &writer,
                source,
                &expected_type,
                &mut summary,
            )
            .await;

        match outcome {
            Ok(true) => {
                // Shutdown requested: checkpoint state is durable from the
                // last chunk boundary, the item stays allocated and
                // resumable.
                summary.cancelled = true;
                summary.duration_secs = started.elapsed().as_secs_f64();
                info!(
                    rows_processed = summary.rows_processed,
                    "Partition released on shutdown signal"
                );
                Ok(summary)
            },
            Ok(false) => {
                aggregator.finalize().await?;
                checkpoint.complete().await?;
                self.store
                    .complete_attempt(
                        allocated.load_attempt_id,
                        summary.rows_processed,
                        summary.failed,
                    )
                    .await?;

                summary.duration_secs = started.elapsed().as_secs_f64();
                info!(
                    rows_processed = summary.rows_processed,
                    created = summary.created,
                    updated = summary.updated,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    records_loaded = source.records_loaded(),
                    parse_failures = source.parse_failures(),
                    duration_secs = format!("{:.2}", summary.duration_secs),
                    "Partition completed"
                );
                Ok(summary)
            },
            Err(e) => {
                warn!(error = %e, "Partition aborted");
                checkpoint.fail().await;
                Err(e)
            },
        }
    }

    /// The batch loop. Returns true when stopped by cancellation, false when
    /// the source is exhausted.
    async fn run_loop(
        &self,
        checkpoint: &mut CheckpointManager,
        aggregator: &mut OutcomeAggregator,
        writer: &IdempotentWriter,
        source: &mut dyn RecordSource,
        expected_type: &str,
        summary: &mut PartitionSummary,
    ) -> Result<bool, PartitionError> {
        loop {
            if self.cancel.is_cancelled() {
                // Keep checkpoint durability on this exit path too.
                checkpoint
                    .commit(0, aggregator.snapshot(), 0, 0)
                    .await?;
                return Ok(true);
            }

            checkpoint.begin_batch();

            let read_started = Instant::now();
            let items = source
                .read_batch(checkpoint.skip_count(), self.config.batch_size)
                .await?;
            let read_elapsed_ms = read_started.elapsed().as_millis() as i64;

            if items.is_empty() {
                return Ok(false);
            }

            let process_started = Instant::now();
            let consumed = items.len();

            for item in items {
                let outcome = match item {
                    SourceItem::ParseFailure {
                        line_number,
                        message,
                    } => Outcome::Failed {
                        kind: FailureKind::Parse,
                        resource_type: None,
                        message,
                        line_number,
                    },
                    SourceItem::Record(record) => {
                        let issues = self.validator.validate(&record.body);
                        let errors: Vec<&str> = issues
                            .iter()
                            .filter(|i| i.severity == IssueSeverity::Error)
                            .map(|i| i.detail.as_str())
                            .collect();

                        if errors.is_empty() {
                            writer
                                .write_record(&record, self.config.skip_enabled)
                                .await
                        } else {
                            Outcome::Failed {
                                kind: FailureKind::Validation,
                                resource_type: Some(record.resource_type.clone()),
                                message: errors.join("; "),
                                line_number: record.line_number,
                            }
                        }
                    },
                };

                match &outcome {
                    Outcome::Created { .. } => summary.created += 1,
                    Outcome::Updated { .. } => summary.updated += 1,
                    Outcome::Skipped { .. } => summary.skipped += 1,
                    Outcome::Failed { .. } => summary.failed += 1,
                }
                summary.rows_processed += 1;
                self.metrics.record(expected_type, 1);

                aggregator.push(&outcome).await?;
            }

            let process_elapsed_ms = process_started.elapsed().as_millis() as i64;

            // Chunk boundary: outcome bytes first, then the checkpoint that
            // marks them committed. A crash in between redelivers at most
            // this one batch.
            aggregator.flush().await?;
            checkpoint
                .commit(
                    consumed,
                    aggregator.snapshot(),
                    read_elapsed_ms,
                    process_elapsed_ms,
                )
                .await?;
        }
    }
}
