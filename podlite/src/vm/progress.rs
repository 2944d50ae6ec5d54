//! Pending-work bookkeeping driving the readiness predicate.

use std::collections::HashSet;

/// Membership sets for outstanding async work, one per resource family.
///
/// `ttys` and `serial_ports` are tracked for diagnostics but deliberately do
/// not participate in [`PendingSet::is_empty`]; only the four device
/// families gate readiness.
#[derive(Debug, Default)]
pub struct PendingSet {
    pub containers: HashSet<usize>,
    pub volumes: HashSet<String>,
    /// Images and volumes together; the two namespaces are disjoint.
    pub blockdevs: HashSet<String>,
    pub networks: HashSet<usize>,
    pub ttys: HashSet<usize>,
    pub serial_ports: HashSet<usize>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
            && self.volumes.is_empty()
            && self.blockdevs.is_empty()
            && self.networks.is_empty()
    }
}

/// The three phases of progress: dispatched, tearing down, and done.
///
/// `finished` is append-only within a phase and never consulted for
/// correctness; it only makes duplicate completion events harmless.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    pub adding: PendingSet,
    pub deleting: PendingSet,
    pub finished: PendingSet,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff no preparation or teardown work is outstanding.
    ///
    /// This is the sole trigger for "all devices present, tell the guest to
    /// run" and for the shutdown drain.
    pub fn device_ready(&self) -> bool {
        self.adding.is_empty() && self.deleting.is_empty()
    }

    /// Mark a container completion: record it finished, clear it from adding.
    pub fn container_done(&mut self, idx: usize) {
        self.finished.containers.insert(idx);
        self.adding.containers.remove(&idx);
    }

    pub fn volume_done(&mut self, name: &str) {
        self.finished.volumes.insert(name.to_string());
        self.adding.volumes.remove(name);
    }

    pub fn blockdev_done(&mut self, name: &str) {
        self.finished.blockdevs.insert(name.to_string());
        self.adding.blockdevs.remove(name);
    }

    pub fn network_done(&mut self, idx: usize) {
        self.finished.networks.insert(idx);
        self.adding.networks.remove(&idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker_is_ready() {
        let tracker = ProgressTracker::new();
        assert!(tracker.device_ready());
    }

    #[test]
    fn test_ready_iff_adding_and_deleting_empty() {
        let mut tracker = ProgressTracker::new();

        tracker.adding.containers.insert(0);
        assert!(!tracker.device_ready());
        tracker.container_done(0);
        assert!(tracker.device_ready());

        tracker.adding.volumes.insert("v1".into());
        tracker.adding.blockdevs.insert("v1".into());
        assert!(!tracker.device_ready());
        tracker.volume_done("v1");
        assert!(!tracker.device_ready());
        tracker.blockdev_done("v1");
        assert!(tracker.device_ready());

        tracker.deleting.networks.insert(2);
        assert!(!tracker.device_ready());
        tracker.deleting.networks.remove(&2);
        assert!(tracker.device_ready());
    }

    #[test]
    fn test_duplicate_completions_are_harmless() {
        let mut tracker = ProgressTracker::new();
        tracker.adding.containers.insert(0);

        tracker.container_done(0);
        tracker.container_done(0);
        assert!(tracker.device_ready());
        assert!(tracker.finished.containers.contains(&0));
    }

    #[test]
    fn test_ttys_do_not_gate_readiness() {
        let mut tracker = ProgressTracker::new();
        tracker.adding.ttys.insert(1);
        tracker.adding.serial_ports.insert(1);
        assert!(tracker.device_ready());
    }
}
