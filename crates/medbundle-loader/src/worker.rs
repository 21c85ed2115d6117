//! Worker runtime
//!
//! One `LoaderWorker` per process: registers a LoaderInstance, keeps its
//! heartbeat fresh, and runs the allocate/dispatch loop over a fixed-size
//! pool of partition tasks. Each partition runs on its own task so blocking
//! I/O in one never stalls the others. Shutdown cancels between batches;
//! claimed items stay allocated and resumable.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::allocation::AllocationStore;
use crate::config::LoaderConfig;
use crate::metrics::MetricsCollector;
use crate::models::{InstanceStatus, LoaderInstance};
use crate::object_store::OutcomeStore;
use crate::partition::{PartitionConfig, PartitionProcessor};
use crate::source::{PersistenceCapability, RecordSourceFactory, Validator};

/// A worker process hosting a pool of partition tasks
pub struct LoaderWorker {
    store: Arc<dyn AllocationStore>,
    outcome_store: Arc<dyn OutcomeStore>,
    persistence: Arc<dyn PersistenceCapability>,
    validator: Arc<dyn Validator>,
    sources: Arc<dyn RecordSourceFactory>,
    metrics: Arc<MetricsCollector>,
    config: LoaderConfig,
    cancel: CancellationToken,
}

impl LoaderWorker {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        outcome_store: Arc<dyn OutcomeStore>,
        persistence: Arc<dyn PersistenceCapability>,
        validator: Arc<dyn Validator>,
        sources: Arc<dyn RecordSourceFactory>,
        config: LoaderConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new(config.metrics_sample_interval));
        Self {
            store,
            outcome_store,
            persistence,
            validator,
            sources,
            metrics,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token for wiring an external shutdown signal (e.g. ctrl-c)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Registers the instance, claims work as partition
    /// slots free up, and marks the instance stopped on the way out.
    pub async fn run(&self) -> Result<()> {
        let instance = LoaderInstance::for_current_process();
        self.store
            .register_instance(&instance)
            .await
            .context("Failed to register loader instance")?;
        self.store
            .set_instance_status(instance.id, InstanceStatus::Active)
            .await
            .context("Failed to activate loader instance")?;

        let heartbeat = self.spawn_heartbeat(instance.id);

        info!(
            instance_id = %instance.id,
            max_partitions = self.config.max_partitions,
            file_type = self.config.file_type.as_str(),
            "Loader worker started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let free_slots = self.config.max_partitions.saturating_sub(tasks.len());
            if free_slots > 0 {
                match self
                    .store
                    .allocate_work(
                        self.config.file_type,
                        instance.id,
                        free_slots as i64,
                        &self.config.path_filters,
                    )
                    .await
                {
                    Ok(items) => {
                        for allocated in items {
                            self.spawn_partition(&mut tasks, allocated);
                        }
                    },
                    Err(e) => {
                        // Retryable by design; the next pass tries again.
                        warn!(error = %e, "Allocation call failed");
                    },
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Partition task panicked");
                    }
                },
                _ = sleep(Duration::from_secs(self.config.poll_interval_secs)) => {},
            }
        }

        info!("Shutdown requested, draining partition tasks");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Partition task panicked during drain");
            }
        }

        heartbeat.abort();
        self.store
            .set_instance_status(instance.id, InstanceStatus::Stopped)
            .await
            .context("Failed to mark loader instance stopped")?;

        info!(instance_id = %instance.id, "Loader worker stopped");
        Ok(())
    }

    fn spawn_heartbeat(&self, instance_id: uuid::Uuid) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.touch_heartbeat(instance_id).await {
                            warn!(error = %e, "Heartbeat update failed");
                        }
                    },
                }
            }
        })
    }

    fn spawn_partition(&self, tasks: &mut JoinSet<()>, allocated: crate::models::AllocatedItem) {
        let processor = PartitionProcessor::new(
            self.store.clone(),
            self.outcome_store.clone(),
            self.persistence.clone(),
            self.validator.clone(),
            self.metrics.clone(),
            PartitionConfig::from(&self.config),
            self.cancel.clone(),
        );
        let sources = self.sources.clone();

        tasks.spawn(async move {
            let mut source = match sources.open(&allocated.item).await {
                Ok(source) => source,
                Err(e) => {
                    error!(
                        work_item_id = allocated.item.id,
                        error = %e,
                        "Could not open record source, leaving item for reclaim"
                    );
                    return;
                },
            };

            match processor.run(&allocated, source.as_mut()).await {
                Ok(summary) if summary.cancelled => {
                    info!(
                        work_item_id = summary.work_item_id,
                        rows_processed = summary.rows_processed,
                        "Partition released before completion"
                    );
                },
                Ok(summary) => {
                    info!(
                        work_item_id = summary.work_item_id,
                        rows_processed = summary.rows_processed,
                        failed = summary.failed,
                        "Partition finished"
                    );
                },
                Err(e) => {
                    error!(
                        work_item_id = allocated.item.id,
                        error = %e,
                        "Partition aborted, allocation left for reclaim"
                    );
                },
            }
        });
    }
}
