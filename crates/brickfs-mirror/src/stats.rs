//! Mirror counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug, Default)]
pub(crate) struct MirrorStatsInner {
    pub(crate) fan_outs: AtomicU64,
    pub(crate) rollbacks: AtomicU64,
    pub(crate) rollback_failures: AtomicU64,
    pub(crate) ejections: AtomicU64,
    pub(crate) backups_unavailable: AtomicU64,
}

impl MirrorStatsInner {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active: usize, subvolumes: usize) -> MirrorStats {
        MirrorStats {
            subvolumes,
            active,
            fan_outs: self.fan_outs.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            ejections: self.ejections.load(Ordering::Relaxed),
            backups_unavailable: self.backups_unavailable.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of one mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    /// Configured subvolumes.
    pub subvolumes: usize,
    /// Subvolumes still active.
    pub active: usize,
    /// Mutations fanned out to the active set.
    pub fan_outs: u64,
    /// Partial fan-outs that were undone.
    pub rollbacks: u64,
    /// Compensating calls that failed (each ends in an ejection).
    pub rollback_failures: u64,
    /// Subvolumes ejected by this mirror.
    pub ejections: u64,
    /// Mutations that ran without a usable backup.
    pub backups_unavailable: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let inner = MirrorStatsInner::default();
        MirrorStatsInner::bump(&inner.fan_outs);
        MirrorStatsInner::bump(&inner.fan_outs);
        MirrorStatsInner::bump(&inner.ejections);
        let s = inner.snapshot(1, 2);
        assert_eq!(s.fan_outs, 2);
        assert_eq!(s.ejections, 1);
        assert_eq!((s.active, s.subvolumes), (1, 2));
        assert_eq!(s.rollbacks, 0);
    }
}
