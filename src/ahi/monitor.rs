//! Event counters for the hash system.
//!
//! Everything here is advisory and relaxed; the counters exist so an
//! operator can see whether the hash is pulling its weight, not to
//! synchronize anything.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Monitor {
    /// Entries inserted (builds, insert-side maintenance, lazy repairs).
    pub rows_added: AtomicU64,
    /// Entries removed through drops and delete-side maintenance.
    pub rows_removed: AtomicU64,
    /// Delete-side erases that found no entry (stale coverage, tolerated).
    pub rows_remove_not_found: AtomicU64,
    /// Entries repointed in place after a hash-guided insert.
    pub rows_updated: AtomicU64,
    /// Inserts silently dropped because the slab had no spare page.
    pub rows_skipped_no_slab: AtomicU64,
    /// Pages that gained hash coverage.
    pub pages_added: AtomicU64,
    /// Pages whose hash coverage was dropped.
    pub pages_removed: AtomicU64,
    /// Guesses that returned a positioned cursor.
    pub guess_success: AtomicU64,
    /// Guesses that bailed for any reason.
    pub guess_fail: AtomicU64,
    /// Guesses whose chain hit failed the in-page validation.
    pub guess_corrupt: AtomicU64,
}

/// Plain-value copy of the counters, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub rows_added: u64,
    pub rows_removed: u64,
    pub rows_remove_not_found: u64,
    pub rows_updated: u64,
    pub rows_skipped_no_slab: u64,
    pub pages_added: u64,
    pub pages_removed: u64,
    pub guess_success: u64,
    pub guess_fail: u64,
    pub guess_corrupt: u64,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            rows_added: self.rows_added.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            rows_remove_not_found: self.rows_remove_not_found.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            rows_skipped_no_slab: self.rows_skipped_no_slab.load(Ordering::Relaxed),
            pages_added: self.pages_added.load(Ordering::Relaxed),
            pages_removed: self.pages_removed.load(Ordering::Relaxed),
            guess_success: self.guess_success.load(Ordering::Relaxed),
            guess_fail: self.guess_fail.load(Ordering::Relaxed),
            guess_corrupt: self.guess_corrupt.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let monitor = Monitor::new();
        Monitor::inc(&monitor.rows_added);
        Monitor::add(&monitor.rows_removed, 3);

        let snap = monitor.snapshot();
        assert_eq!(snap.rows_added, 1);
        assert_eq!(snap.rows_removed, 3);
        assert_eq!(snap.guess_success, 0);
    }
}
