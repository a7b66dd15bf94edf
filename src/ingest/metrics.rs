use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::MergeOutcome;

/// Pipeline counters. All updates are relaxed; readers take a `snapshot()`.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub fetches_ok: AtomicU64,
    pub fetches_failed: AtomicU64,
    pub candles_loaded: AtomicU64,
    pub merges_inserted: AtomicU64,
    pub merges_updated: AtomicU64,
    pub merges_rejected: AtomicU64,
    pub events_received: AtomicU64,
    pub events_dropped: AtomicU64,
    pub retries_queued: AtomicU64,
    pub retries_succeeded: AtomicU64,
    pub retries_failed: AtomicU64,
    pub retries_dropped: AtomicU64,
    pub cooldowns: AtomicU64,
    pub subscription_errors: AtomicU64,
    pub directory_syncs: AtomicU64,
    pub directory_sync_failures: AtomicU64,
    pub snapshots_published: AtomicU64,
}

impl PipelineMetrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self, outcome: MergeOutcome) {
        let counter = match outcome {
            MergeOutcome::Inserted => &self.merges_inserted,
            MergeOutcome::Updated => &self.merges_updated,
            MergeOutcome::Rejected => &self.merges_rejected,
        };
        Self::incr(counter);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            fetches_ok: self.fetches_ok.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            candles_loaded: self.candles_loaded.load(Ordering::Relaxed),
            merges_inserted: self.merges_inserted.load(Ordering::Relaxed),
            merges_updated: self.merges_updated.load(Ordering::Relaxed),
            merges_rejected: self.merges_rejected.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            retries_queued: self.retries_queued.load(Ordering::Relaxed),
            retries_succeeded: self.retries_succeeded.load(Ordering::Relaxed),
            retries_failed: self.retries_failed.load(Ordering::Relaxed),
            retries_dropped: self.retries_dropped.load(Ordering::Relaxed),
            cooldowns: self.cooldowns.load(Ordering::Relaxed),
            subscription_errors: self.subscription_errors.load(Ordering::Relaxed),
            directory_syncs: self.directory_syncs.load(Ordering::Relaxed),
            directory_sync_failures: self.directory_sync_failures.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PipelineMetricsSnapshot {
    pub fetches_ok: u64,
    pub fetches_failed: u64,
    pub candles_loaded: u64,
    pub merges_inserted: u64,
    pub merges_updated: u64,
    pub merges_rejected: u64,
    pub events_received: u64,
    pub events_dropped: u64,
    pub retries_queued: u64,
    pub retries_succeeded: u64,
    pub retries_failed: u64,
    pub retries_dropped: u64,
    pub cooldowns: u64,
    pub subscription_errors: u64,
    pub directory_syncs: u64,
    pub directory_sync_failures: u64,
    pub snapshots_published: u64,
}
