//! Runtime-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters covering every pod the runtime has touched.
///
/// Updated with relaxed ordering; these are observability numbers, not
/// synchronization points.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub pods_started: AtomicU64,
    pub pods_failed: AtomicU64,
    pub pods_stopped: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_started(&self) {
        self.pods_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.pods_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stopped(&self) {
        self.pods_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pods_started: self.pods_started.load(Ordering::Relaxed),
            pods_failed: self.pods_failed.load(Ordering::Relaxed),
            pods_stopped: self.pods_stopped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pods_started: u64,
    pub pods_failed: u64,
    pub pods_stopped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = RuntimeMetrics::new();
        m.incr_started();
        m.incr_started();
        m.incr_failed();

        let snap = m.snapshot();
        assert_eq!(snap.pods_started, 2);
        assert_eq!(snap.pods_failed, 1);
        assert_eq!(snap.pods_stopped, 0);
    }
}
