//! Queue statistics.
//!
//! Live counts come from the queue itself; historical aggregates are kept by
//! [`StatsCollector`], which only sees lifecycle events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, elapsed_between};
use crate::jobs::events::{JobEvent, JobEventSink};

/// Snapshot returned by `PriorityJobQueue::stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    /// Mean measured duration of completed and failed attempts.
    pub avg_processing_time: Duration,
    /// `completed / (completed + failed)`, 0 when nothing finished yet.
    pub success_rate: f64,
    /// Completed jobs per minute since the collector started.
    pub throughput_per_minute: f64,
}

#[derive(Debug, Default)]
struct Aggregates {
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    processing_total: Duration,
    processing_samples: u32,
}

/// Historical aggregates fed by terminal-status events.
pub struct StatsCollector {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    aggregates: Mutex<Aggregates>,
}

impl StatsCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            aggregates: Mutex::new(Aggregates::default()),
        }
    }

    /// Fill the historical half of `stats`.
    pub fn fill(&self, stats: &mut QueueStats) {
        let agg = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
        stats.completed = agg.completed;
        stats.failed = agg.failed;
        stats.cancelled = agg.cancelled;
        stats.retried = agg.retried;
        stats.avg_processing_time = if agg.processing_samples == 0 {
            Duration::ZERO
        } else {
            agg.processing_total / agg.processing_samples
        };

        let finished = agg.completed + agg.failed;
        stats.success_rate = if finished == 0 {
            0.0
        } else {
            agg.completed as f64 / finished as f64
        };

        let elapsed = elapsed_between(self.started_at, self.clock.now()).as_secs_f64();
        stats.throughput_per_minute = agg.completed as f64 * 60.0 / elapsed.max(1.0);
    }

    pub fn snapshot(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        self.fill(&mut stats);
        stats
    }
}

impl JobEventSink for StatsCollector {
    fn on_event(&self, event: &JobEvent) {
        let mut agg = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
        let processing = match event {
            JobEvent::Completed { record } => {
                agg.completed += 1;
                record.processing_time()
            }
            JobEvent::Failed { record, .. } => {
                agg.failed += 1;
                record.processing_time()
            }
            JobEvent::Cancelled { .. } => {
                agg.cancelled += 1;
                None
            }
            JobEvent::Retrying { .. } => {
                agg.retried += 1;
                None
            }
            _ => None,
        };
        if let Some(duration) = processing {
            agg.processing_total += duration;
            agg.processing_samples = agg.processing_samples.saturating_add(1);
        }
    }
}
