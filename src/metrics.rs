//! Store operation counters.
//!
//! Lock-free counters shared by the swap directory and its completion
//! paths, with point-in-time snapshots for reporting.

use crate::sync::{AtomicU64, Ordering};

/// Atomic counters for one swap directory.
#[derive(Debug, Default)]
pub struct StoreCounters {
    /// Lookup operations.
    pub gets: AtomicU64,
    /// Lookups that found the key.
    pub get_hits: AtomicU64,
    /// Lookups that did not find the key.
    pub get_misses: AtomicU64,
    /// Cell writes started.
    pub creates: AtomicU64,
    /// Cell reads opened.
    pub opens: AtomicU64,
    /// Writes that completed with an error.
    pub write_errors: AtomicU64,
    /// Entries unlinked by the outer store.
    pub unlinks: AtomicU64,
    /// Entries released by maintenance purging.
    pub releases: AtomicU64,
}

impl StoreCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lookup.
    #[inline]
    pub fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a cell write being started.
    #[inline]
    pub fn record_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cell read being opened.
    #[inline]
    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed write completion.
    #[inline]
    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unlink.
    #[inline]
    pub fn record_unlink(&self) {
        self.unlinks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a maintenance release.
    #[inline]
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            unlinks: self.unlinks.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of counter values at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Lookup operations.
    pub gets: u64,
    /// Lookups that found the key.
    pub get_hits: u64,
    /// Lookups that did not find the key.
    pub get_misses: u64,
    /// Cell writes started.
    pub creates: u64,
    /// Cell reads opened.
    pub opens: u64,
    /// Writes that completed with an error.
    pub write_errors: u64,
    /// Entries unlinked by the outer store.
    pub unlinks: u64,
    /// Entries released by maintenance purging.
    pub releases: u64,
}

impl CounterSnapshot {
    /// Hit rate as a percentage (0.0 - 100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.get_hits + self.get_misses;
        if total == 0 {
            0.0
        } else {
            (self.get_hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = StoreCounters::new();
        counters.record_get(true);
        counters.record_get(true);
        counters.record_get(false);
        counters.record_create();
        counters.record_open();
        counters.record_write_error();
        counters.record_unlink();
        counters.record_release();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.gets, 3);
        assert_eq!(snapshot.get_hits, 2);
        assert_eq!(snapshot.get_misses, 1);
        assert_eq!(snapshot.creates, 1);
        assert_eq!(snapshot.opens, 1);
        assert_eq!(snapshot.write_errors, 1);
        assert_eq!(snapshot.unlinks, 1);
        assert_eq!(snapshot.releases, 1);
    }

    #[test]
    fn hit_rate() {
        let snapshot = CounterSnapshot {
            get_hits: 3,
            get_misses: 1,
            ..CounterSnapshot::default()
        };
        assert!((snapshot.hit_rate() - 75.0).abs() < 0.001);
        assert_eq!(CounterSnapshot::default().hit_rate(), 0.0);
    }
}
