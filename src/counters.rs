//! Process-wide page counters and the per-spider run report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Success/failure page counts for the current run.
#[derive(Debug, Default)]
pub struct PageStats {
    success: AtomicU64,
    failure: AtomicU64,
}

impl PageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.success.store(0, Ordering::Relaxed);
        self.failure.store(0, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.successes() + self.failures()
    }
}

/// Per-spider subtotal emitted by the pipeline when a spider finishes.
#[derive(Debug, Clone)]
pub struct Report {
    pub spider_name: String,
    pub keyword: String,
    pub data_count: u64,
    pub file_count: u64,
    pub elapsed: Duration,
}
