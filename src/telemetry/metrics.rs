//! Metrics collection for pipelines and pools.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters and latency histogram shared by a pipeline or pool.
#[derive(Debug)]
pub struct Metrics {
    stage_runs: AtomicU64,
    tasks_executed: AtomicU64,
    copy_errors: AtomicU64,
    latency_histogram: RwLock<Histogram<u64>>,
    start_time: Instant,
}

impl Metrics {
    /// Fresh collector.
    pub fn new() -> Self {
        // 3 significant figures, 1 hour ceiling in nanoseconds
        let histogram =
            Histogram::new_with_max(3_600_000_000_000, 3).expect("failed to create histogram");

        Self {
            stage_runs: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            copy_errors: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    /// Record one stage run with its duration
    pub fn record_stage_run(&self, duration_ns: u64) {
        self.stage_runs.fetch_add(1, Ordering::Relaxed);
        if let Some(mut hist) = self.latency_histogram.try_write() {
            let _ = hist.record(duration_ns);
        }
    }

    /// Record one task execution with its duration
    pub fn record_task(&self, duration_ns: u64) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if let Some(mut hist) = self.latency_histogram.try_write() {
            let _ = hist.record(duration_ns);
        }
    }

    /// Record a rejected boundary copy
    pub fn record_copy_error(&self) {
        self.copy_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Stage runs so far
    pub fn stage_runs(&self) -> u64 {
        self.stage_runs.load(Ordering::Relaxed)
    }

    /// Tasks executed so far
    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    /// Rejected boundary copies so far
    pub fn copy_errors(&self) -> u64 {
        self.copy_errors.load(Ordering::Relaxed)
    }

    /// Latency percentile in nanoseconds
    pub fn latency_percentile(&self, q: f64) -> u64 {
        self.latency_histogram.read().value_at_quantile(q)
    }

    /// Seconds since the collector was created
    pub fn uptime_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
