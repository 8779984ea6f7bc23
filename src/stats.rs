//! Allocation and scanning statistics.
//!
//! One `Stats` instance serves every engine; fields an engine has no
//! use for simply stay at zero. Counters are relaxed atomics so the
//! unlocked fast paths can bump them without fences. The probe counters
//! at the bottom measure hot-path helper traffic and are maintained in
//! debug builds only.
//!
//! Validation passes iterate the same structures the counters observe,
//! so they snapshot the statistics first and restore them afterwards;
//! a validation run must not perturb the metrics it is checking.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

#[derive(Default)]
pub struct Stats {
    pub minor_collections: AtomicU64,
    pub major_collections: AtomicU64,
    pub total_create: AtomicU64,
    pub total_delete: AtomicU64,
    pub total_modify: AtomicU64,
    /// Slots visited by scans, free slots included.
    pub total_scanning_work_minor: AtomicU64,
    pub total_scanning_work_major: AtomicU64,
    /// Full slots actually forwarded to the scanning action.
    pub useful_scanning_work: AtomicU64,
    pub total_minor_time_ns: AtomicU64,
    pub total_major_time_ns: AtomicU64,
    pub peak_minor_time_ns: AtomicU64,
    pub peak_major_time_ns: AtomicU64,
    pub total_alloced_pools: AtomicU64,
    pub total_freed_pools: AtomicU64,
    pub live_pools: AtomicU64,
    pub peak_pools: AtomicU64,
    /// Ring mutations (pushes, pops, removals).
    pub ring_operations: AtomicU64,
    // Hot-path probes, debug builds only.
    pub young_checks: AtomicU64,
    pub header_recoveries: AtomicU64,
    pub free_slot_checks: AtomicU64,
    pub empty_list_checks: AtomicU64,
    pub remembered: AtomicU64,
    pub pool_searches: AtomicU64,
    pub pool_search_work: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Relaxed);
}

/// Bump a counter in debug builds only.
#[inline]
pub(crate) fn probe(counter: &AtomicU64) {
    if cfg!(debug_assertions) {
        counter.fetch_add(1, Relaxed);
    }
}

/// A point-in-time copy of every counter.
pub struct StatsSnapshot([u64; Stats::FIELD_COUNT]);

impl Stats {
    const FIELD_COUNT: usize = 24;

    pub fn new() -> Stats {
        Stats::default()
    }

    fn fields(&self) -> [&AtomicU64; Stats::FIELD_COUNT] {
        [
            &self.minor_collections,
            &self.major_collections,
            &self.total_create,
            &self.total_delete,
            &self.total_modify,
            &self.total_scanning_work_minor,
            &self.total_scanning_work_major,
            &self.useful_scanning_work,
            &self.total_minor_time_ns,
            &self.total_major_time_ns,
            &self.peak_minor_time_ns,
            &self.peak_major_time_ns,
            &self.total_alloced_pools,
            &self.total_freed_pools,
            &self.live_pools,
            &self.peak_pools,
            &self.ring_operations,
            &self.young_checks,
            &self.header_recoveries,
            &self.free_slot_checks,
            &self.empty_list_checks,
            &self.remembered,
            &self.pool_searches,
            &self.pool_search_work,
        ]
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot(self.fields().map(|f| f.load(Relaxed)))
    }

    pub fn restore(&self, snapshot: &StatsSnapshot) {
        for (field, &saved) in self.fields().iter().zip(snapshot.0.iter()) {
            field.store(saved, Relaxed);
        }
    }

    pub fn reset(&self) {
        self.restore(&StatsSnapshot([0; Stats::FIELD_COUNT]));
    }

    /// Account one pool allocation, tracking the live/peak watermarks.
    pub(crate) fn note_pool_alloc(&self) {
        bump(&self.total_alloced_pools);
        let live = self.live_pools.fetch_add(1, Relaxed) + 1;
        self.peak_pools.fetch_max(live, Relaxed);
    }

    pub(crate) fn note_pool_free(&self) {
        bump(&self.total_freed_pools);
        self.live_pools.fetch_sub(1, Relaxed);
    }

    /// Fold one scan duration into the totals and peaks for its kind.
    pub(crate) fn record_scan_time(&self, minor: bool, duration: Duration) {
        let ns = duration.as_nanos() as u64;
        let (total, peak) = if minor {
            (&self.total_minor_time_ns, &self.peak_minor_time_ns)
        } else {
            (&self.total_major_time_ns, &self.peak_major_time_ns)
        };
        total.fetch_add(ns, Relaxed);
        peak.fetch_max(ns, Relaxed);
    }

    /// Write a human-readable report to stdout.
    pub fn print(&self) {
        let minors = self.minor_collections.load(Relaxed);
        let majors = self.major_collections.load(Relaxed);
        println!("minor collections: {minors}");
        println!("major collections (and others): {majors}");

        println!(
            "total allocated pools: {} (peak {}, freed {}, live {})",
            self.total_alloced_pools.load(Relaxed),
            self.peak_pools.load(Relaxed),
            self.total_freed_pools.load(Relaxed),
            self.live_pools.load(Relaxed),
        );

        let work_minor = self.total_scanning_work_minor.load(Relaxed);
        let work_major = self.total_scanning_work_major.load(Relaxed);
        let useful = self.useful_scanning_work.load(Relaxed);
        println!("work per minor: {}", average(work_minor, minors));
        println!("work per major: {}", average(work_major, majors));
        println!(
            "total scanning work: {} ({} useful)",
            work_minor + work_major,
            useful,
        );

        println!(
            "average time per minor: {}ns (peak {}ns)",
            average(self.total_minor_time_ns.load(Relaxed), minors),
            self.peak_minor_time_ns.load(Relaxed),
        );
        println!(
            "average time per major: {}ns (peak {}ns)",
            average(self.total_major_time_ns.load(Relaxed), majors),
            self.peak_major_time_ns.load(Relaxed),
        );

        println!(
            "total ring operations: {} ({} per pool)",
            self.ring_operations.load(Relaxed),
            average(
                self.ring_operations.load(Relaxed),
                self.total_alloced_pools.load(Relaxed),
            ),
        );

        if cfg!(debug_assertions) {
            println!(
                "total created: {} deleted: {} modified: {}",
                self.total_create.load(Relaxed),
                self.total_delete.load(Relaxed),
                self.total_modify.load(Relaxed),
            );
            println!(
                "young checks: {} header recoveries: {} free-slot checks: {}",
                self.young_checks.load(Relaxed),
                self.header_recoveries.load(Relaxed),
                self.free_slot_checks.load(Relaxed),
            );
            println!(
                "empty-list checks: {} remembered: {}",
                self.empty_list_checks.load(Relaxed),
                self.remembered.load(Relaxed),
            );
            println!(
                "pool searches: {} (work {})",
                self.pool_searches.load(Relaxed),
                self.pool_search_work.load(Relaxed),
            );
        }
    }
}

// Rounds to nearest.
fn average(total: u64, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    (total + count / 2) / count
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_restore_round_trip() {
        let stats = Stats::new();
        bump(&stats.total_create);
        bump(&stats.total_create);
        bump(&stats.ring_operations);
        let saved = stats.snapshot();
        add(&stats.total_create, 10);
        bump(&stats.young_checks);
        stats.restore(&saved);
        assert_eq!(stats.total_create.load(Relaxed), 2);
        assert_eq!(stats.ring_operations.load(Relaxed), 1);
        assert_eq!(stats.young_checks.load(Relaxed), 0);
    }

    #[test]
    fn pool_watermarks() {
        let stats = Stats::new();
        stats.note_pool_alloc();
        stats.note_pool_alloc();
        stats.note_pool_free();
        stats.note_pool_alloc();
        assert_eq!(stats.live_pools.load(Relaxed), 2);
        assert_eq!(stats.peak_pools.load(Relaxed), 2);
        assert_eq!(stats.total_alloced_pools.load(Relaxed), 3);
        assert_eq!(stats.total_freed_pools.load(Relaxed), 1);
    }
}
