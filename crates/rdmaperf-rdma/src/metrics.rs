//! Per-connection transfer counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transfer metrics at a point in time.
pub struct MetricsSnapshot {
    /// Transfer calls that returned a byte count.
    pub transfers_completed: u64,
    /// Transfer calls that returned an error.
    pub transfers_failed: u64,
    /// Bytes reported by completed transfers.
    pub bytes_transferred: u64,
    /// Two-sided sends posted.
    pub sends_posted: u64,
    /// RDMA reads posted.
    pub rdma_reads_posted: u64,
    /// RDMA writes posted.
    pub rdma_writes_posted: u64,
    /// Receives completed successfully.
    pub recvs_completed: u64,
    /// Completions flushed during teardown.
    pub flushed_completions: u64,
    /// Connection-manager events handled.
    pub cm_events: u64,
}

/// Thread-safe transfer counters shared by the worker and both event loops.
pub struct TransferMetrics {
    transfers_completed: AtomicU64,
    transfers_failed: AtomicU64,
    bytes_transferred: AtomicU64,
    sends_posted: AtomicU64,
    rdma_reads_posted: AtomicU64,
    rdma_writes_posted: AtomicU64,
    recvs_completed: AtomicU64,
    flushed_completions: AtomicU64,
    cm_events: AtomicU64,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransferMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransferMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            sends_posted: AtomicU64::new(0),
            rdma_reads_posted: AtomicU64::new(0),
            rdma_writes_posted: AtomicU64::new(0),
            recvs_completed: AtomicU64::new(0),
            flushed_completions: AtomicU64::new(0),
            cm_events: AtomicU64::new(0),
        }
    }

    /// Records a transfer that moved `bytes`.
    pub fn transfer_completed(&self, bytes: u64) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a failed transfer.
    pub fn transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the sends posted counter.
    pub fn inc_sends_posted(&self) {
        self.sends_posted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the RDMA reads posted counter.
    pub fn inc_rdma_reads_posted(&self) {
        self.rdma_reads_posted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the RDMA writes posted counter.
    pub fn inc_rdma_writes_posted(&self) {
        self.rdma_writes_posted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the receives completed counter.
    pub fn inc_recvs_completed(&self) {
        self.recvs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the flushed completions counter.
    pub fn inc_flushed_completions(&self) {
        self.flushed_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the connection-manager events counter.
    pub fn inc_cm_events(&self) {
        self.cm_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            sends_posted: self.sends_posted.load(Ordering::Relaxed),
            rdma_reads_posted: self.rdma_reads_posted.load(Ordering::Relaxed),
            rdma_writes_posted: self.rdma_writes_posted.load(Ordering::Relaxed),
            recvs_completed: self.recvs_completed.load(Ordering::Relaxed),
            flushed_completions: self.flushed_completions.load(Ordering::Relaxed),
            cm_events: self.cm_events.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        assert_eq!(TransferMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_transfer_accounting() {
        let m = TransferMetrics::new();
        m.transfer_completed(4096);
        m.transfer_completed(1024);
        m.transfer_failed();
        m.inc_rdma_writes_posted();
        m.inc_sends_posted();
        m.inc_sends_posted();
        let s = m.snapshot();
        assert_eq!(s.transfers_completed, 2);
        assert_eq!(s.bytes_transferred, 5120);
        assert_eq!(s.transfers_failed, 1);
        assert_eq!(s.rdma_writes_posted, 1);
        assert_eq!(s.sends_posted, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = TransferMetrics::new();
        m.inc_recvs_completed();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["recvs_completed"], 1);
    }
}
