//! Queue metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending or retrying transactions whose dependencies can never complete.
    pub stalled: usize,
    /// Conflicts seen since the queue was opened.
    pub conflicts: usize,
    /// Mean submission round-trip since the queue was opened.
    pub average_processing_time_ms: f64,
    /// `completed / total`, 0 for an empty queue.
    pub success_rate: f64,
    /// Timestamp of the newest completed transaction.
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Running counters that are not derivable from the stored transactions.
#[derive(Debug, Clone, Default)]
pub struct ProcessingStats {
    samples: u64,
    total_ms: f64,
    pub conflicts: usize,
}

impl ProcessingStats {
    /// Record one submission round-trip.
    pub fn record(&mut self, elapsed: Duration) {
        self.samples += 1;
        self.total_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub fn average_ms(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ms / self.samples as f64
        }
    }
}
