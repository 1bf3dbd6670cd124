use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for workers and the master.
///
/// Purpose:
/// - Track event intake and gating on the worker
/// - Track batch flow through the scatter transport
/// - Track merges, resets and snapshot traffic on the master
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Worker intake
    pub events_seen: AtomicUsize,
    pub events_accepted: AtomicUsize,
    pub events_gated: AtomicUsize,
    pub events_skipped: AtomicUsize,

    // Scatter transport
    pub batches_sent: AtomicUsize,
    pub batches_received: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub scatter_connections_active: AtomicUsize,

    // Merger
    pub batches_merged: AtomicUsize,
    pub keys_dropped: AtomicUsize,
    pub misaligned_columns: AtomicUsize,
    pub resets: AtomicUsize,
    pub oracle_errors: AtomicUsize,

    // Snapshot server
    pub snapshots_served: AtomicUsize,
    pub request_errors: AtomicUsize,
    pub snapshot_connections_active: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary for the periodic reporter.
    pub fn summary(&self) -> String {
        let g = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "seen={} accepted={} gated={} skipped={} sent={} recv={} decode_err={} scatter_conn={} merged={} keys_dropped={} misaligned={} resets={} oracle_err={} snapshots={} req_err={} snap_conn={}",
            g(&self.events_seen),
            g(&self.events_accepted),
            g(&self.events_gated),
            g(&self.events_skipped),
            g(&self.batches_sent),
            g(&self.batches_received),
            g(&self.decode_errors),
            g(&self.scatter_connections_active),
            g(&self.batches_merged),
            g(&self.keys_dropped),
            g(&self.misaligned_columns),
            g(&self.resets),
            g(&self.oracle_errors),
            g(&self.snapshots_served),
            g(&self.request_errors),
            g(&self.snapshot_connections_active),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

/// Bumps a counter by one.
pub fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}
