//! Throughput metrics
//!
//! One collector per worker, handed to each partition by constructor
//! injection. Purely observational: a failure here logs and is otherwise
//! invisible to the pipeline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

struct TypeStats {
    total: u64,
    interval_count: u64,
    interval_start: Instant,
}

/// Rolling records/second sampling, keyed by resource type
pub struct MetricsCollector {
    sample_interval: u64,
    stats: Mutex<HashMap<String, TypeStats>>,
}

impl MetricsCollector {
    /// `sample_interval` is the record count between reported rate samples
    pub fn new(sample_interval: u64) -> Self {
        Self {
            sample_interval: sample_interval.max(1),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Count processed records of one type, reporting a rate each time the
    /// running count crosses the sampling interval
    pub fn record(&self, resource_type: &str, count: u64) {
        let mut stats = match self.stats.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "Metrics lock poisoned, sample dropped");
                return;
            },
        };

        let entry = stats
            .entry(resource_type.to_string())
            .or_insert_with(|| TypeStats {
                total: 0,
                interval_count: 0,
                interval_start: Instant::now(),
            });

        entry.total += count;
        entry.interval_count += count;

        if entry.interval_count >= self.sample_interval {
            let elapsed = entry.interval_start.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                entry.interval_count as f64 / elapsed
            } else {
                0.0
            };

            info!(
                resource_type,
                total = entry.total,
                rate_per_sec = format!("{:.1}", rate),
                "Ingestion throughput"
            );

            entry.interval_count = 0;
            entry.interval_start = Instant::now();
        }
    }

    /// Total records seen for one type
    pub fn total(&self, resource_type: &str) -> u64 {
        self.stats
            .lock()
            .map(|stats| stats.get(resource_type).map(|s| s.total).unwrap_or(0))
            .unwrap_or(0)
    }
}
