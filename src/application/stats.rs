//! In-process admission statistics.
//!
//! Cheap atomic counters for this process only. Cluster-wide numbers live in
//! the metrics collector.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for admission outcomes.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    admitted: AtomicU64,
    throttled: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    /// Checks skipped because the store or probe failed
    failed_open: AtomicU64,
    completed: AtomicU64,
    completed_with_error: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_admitted(&self) {
        self.inner.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttled(&self) {
        self.inner.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.inner.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_open(&self) {
        self.inner.circuit_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_open(&self) {
        self.inner.failed_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, success: bool) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.completed_with_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.inner.admitted.load(Ordering::Relaxed),
            throttled: self.inner.throttled.load(Ordering::Relaxed),
            rate_limited: self.inner.rate_limited.load(Ordering::Relaxed),
            circuit_open: self.inner.circuit_open.load(Ordering::Relaxed),
            failed_open: self.inner.failed_open.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            completed_with_error: self.inner.completed_with_error.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.inner.admitted,
            &self.inner.throttled,
            &self.inner.rate_limited,
            &self.inner.circuit_open,
            &self.inner.failed_open,
            &self.inner.completed,
            &self.inner.completed_with_error,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub throttled: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub failed_open: u64,
    pub completed: u64,
    pub completed_with_error: u64,
}

impl StatsSnapshot {
    pub fn rejected(&self) -> u64 {
        self.throttled
            .saturating_add(self.rate_limited)
            .saturating_add(self.circuit_open)
    }

    /// Admission checks performed (admitted + rejected).
    pub fn total(&self) -> u64 {
        self.admitted.saturating_add(self.rejected())
    }

    /// Ratio of rejected to total checks (0.0 to 1.0); 0.0 when idle.
    pub fn rejection_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.rejected() as f64 / total as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let stats = PipelineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert_eq!(stats.snapshot().rejection_rate(), 0.0);
    }

    #[test]
    fn test_rejection_rate() {
        let stats = PipelineStats::new();
        stats.record_admitted();
        stats.record_throttled();
        stats.record_rate_limited();
        stats.record_circuit_open();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rejected(), 3);
        assert_eq!(snapshot.total(), 4);
        assert!((snapshot.rejection_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_completions() {
        let stats = PipelineStats::new();
        stats.record_completed(true);
        stats.record_completed(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.completed_with_error, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let stats = PipelineStats::new();
        let clone = stats.clone();
        clone.record_admitted();
        assert_eq!(stats.snapshot().admitted, 1);

        stats.reset();
        assert_eq!(clone.snapshot().admitted, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let stats = PipelineStats::new();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = stats.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_admitted();
                        s.record_failed_open();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.snapshot().admitted, 1000);
        assert_eq!(stats.snapshot().failed_open, 1000);
    }
}
