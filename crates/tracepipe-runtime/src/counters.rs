use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-process observable counters for the whole pipeline.
///
/// These are the operational surface of the core; the surrounding read API
/// projects them. Monotonic, lock-free, shared by reference.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub events_read: AtomicU64,
    pub batches_committed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub cdc_published: AtomicU64,
    pub ack_failed: AtomicU64,
    pub records_processed: AtomicU64,
    pub records_retried: AtomicU64,
    pub dlq_total: AtomicU64,
    pub invariant_violations: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub events_read: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub cdc_published: u64,
    pub ack_failed: u64,
    pub records_processed: u64,
    pub records_retried: u64,
    pub dlq_total: u64,
    pub invariant_violations: u64,
}

impl PipelineCounters {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            events_read: self.events_read.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            cdc_published: self.cdc_published.load(Ordering::Relaxed),
            ack_failed: self.ack_failed.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_retried: self.records_retried.load(Ordering::Relaxed),
            dlq_total: self.dlq_total.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
        }
    }
}
