//! Process-wide counters for the control loops
//!
//! Deliberately small: a handful of atomics snapshotted by the stats
//! endpoint. In particular `cleanup_blocked` and `salvage_no_candidate`
//! surface the one liveness gap the sweep cannot fix on its own (a dead
//! node whose blobs never find a salvage target keeps its record forever).

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

#[derive(Debug, Default)]
pub struct Metrics {
    /// Periodic task rounds this node won and ran
    pub jobs_run: AtomicU64,
    /// Rounds lost to another node's lease
    pub jobs_skipped: AtomicU64,
    /// Dead-node records fully cleaned and deleted
    pub nodes_cleaned: AtomicU64,
    /// Cleanup passes that still found rows (node record kept)
    pub cleanup_blocked: AtomicU64,
    /// Salvage attempts with no candidate peer
    pub salvage_no_candidate: AtomicU64,
    /// Orphan replicas scheduled for deletion
    pub gc_scheduled: AtomicU64,
    /// Blobs fetched from peers
    pub fetches_ok: AtomicU64,
    pub fetch_errors: AtomicU64,
    /// Replica removals completed by the removal workers
    pub removals_ok: AtomicU64,
    pub removal_errors: AtomicU64,
    /// Fetches whose computed hash differed from the requested one
    pub hash_mismatch: AtomicU64,
}

/// Point-in-time copy, serializable for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_run: u64,
    pub jobs_skipped: u64,
    pub nodes_cleaned: u64,
    pub cleanup_blocked: u64,
    pub salvage_no_candidate: u64,
    pub gc_scheduled: u64,
    pub fetches_ok: u64,
    pub fetch_errors: u64,
    pub removals_ok: u64,
    pub removal_errors: u64,
    pub hash_mismatch: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_run: self.jobs_run.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            nodes_cleaned: self.nodes_cleaned.load(Ordering::Relaxed),
            cleanup_blocked: self.cleanup_blocked.load(Ordering::Relaxed),
            salvage_no_candidate: self.salvage_no_candidate.load(Ordering::Relaxed),
            gc_scheduled: self.gc_scheduled.load(Ordering::Relaxed),
            fetches_ok: self.fetches_ok.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            removals_ok: self.removals_ok.load(Ordering::Relaxed),
            removal_errors: self.removal_errors.load(Ordering::Relaxed),
            hash_mismatch: self.hash_mismatch.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
