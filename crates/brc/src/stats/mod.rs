//! Stats Module - reference counting statistics
//!
//! Counters are kept per thread and written only by that thread, so the
//! hot paths never contend on a shared cache line. Totals are assembled on
//! demand from every live thread plus the folded counters of threads that
//! have already unregistered.

pub mod metrics;

pub use metrics::MetricValue;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counted events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    RetainLocal,
    RetainRemote,
    ReleaseLocal,
    ReleaseRemote,
    ImmortalRetain,
    ImmortalRelease,
    Allocation,
    Deallocation,
    Merge,
    Queued,
    Drained,
    Promotion,
    WeakCreated,
    WeakCleared,
    CallbackInvoked,
}

const COUNTER_COUNT: usize = Counter::CallbackInvoked as usize + 1;

/// Counters of one registered thread
pub struct ThreadStats {
    enabled: bool,
    counters: [AtomicU64; COUNTER_COUNT],
}

impl ThreadStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn record(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Add to a counter
    ///
    /// Single writer: plain load/store instead of a locked read-modify-write.
    #[inline]
    pub fn add(&self, counter: Counter, n: u64) {
        if !self.enabled {
            return;
        }
        let slot = &self.counters[counter as usize];
        slot.store(slot.load(Ordering::Relaxed) + n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> [u64; COUNTER_COUNT] {
        std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed))
    }

    /// Fold another thread's counters in (many writers)
    fn absorb(&self, other: &ThreadStats) {
        for (mine, theirs) in self.counters.iter().zip(other.snapshot()) {
            mine.fetch_add(theirs, Ordering::Relaxed);
        }
    }
}

/// All thread counters of one runtime
pub(crate) struct StatsRegistry {
    enabled: bool,
    live: Mutex<Vec<Arc<ThreadStats>>>,
    retired: ThreadStats,
}

impl StatsRegistry {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            live: Mutex::new(Vec::new()),
            retired: ThreadStats::new(enabled),
        }
    }

    pub(crate) fn register(&self) -> Arc<ThreadStats> {
        let stats = Arc::new(ThreadStats::new(self.enabled));
        self.live.lock().push(Arc::clone(&stats));
        stats
    }

    pub(crate) fn retire(&self, stats: &Arc<ThreadStats>) {
        let mut live = self.live.lock();
        if let Some(pos) = live.iter().position(|s| Arc::ptr_eq(s, stats)) {
            live.swap_remove(pos);
            self.retired.absorb(stats);
        }
    }

    pub(crate) fn summary(&self) -> StatsSummary {
        let live = self.live.lock();
        let mut totals = self.retired.snapshot();
        for stats in live.iter() {
            for (total, count) in totals.iter_mut().zip(stats.snapshot()) {
                *total += count;
            }
        }
        StatsSummary::from_counts(&totals, live.len())
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub retains_local: u64,
    pub retains_remote: u64,
    pub releases_local: u64,
    pub releases_remote: u64,
    pub immortal_retains: u64,
    pub immortal_releases: u64,
    pub allocations: u64,
    pub deallocations: u64,
    pub merges: u64,
    pub queued: u64,
    pub drained: u64,
    pub promotions: u64,
    pub weakrefs_created: u64,
    pub weakrefs_cleared: u64,
    pub callbacks_invoked: u64,
    pub live_threads: usize,
}

impl StatsSummary {
    fn from_counts(c: &[u64; COUNTER_COUNT], live_threads: usize) -> Self {
        use Counter::*;
        Self {
            retains_local: c[RetainLocal as usize],
            retains_remote: c[RetainRemote as usize],
            releases_local: c[ReleaseLocal as usize],
            releases_remote: c[ReleaseRemote as usize],
            immortal_retains: c[ImmortalRetain as usize],
            immortal_releases: c[ImmortalRelease as usize],
            allocations: c[Allocation as usize],
            deallocations: c[Deallocation as usize],
            merges: c[Merge as usize],
            queued: c[Queued as usize],
            drained: c[Drained as usize],
            promotions: c[Promotion as usize],
            weakrefs_created: c[WeakCreated as usize],
            weakrefs_cleared: c[WeakCleared as usize],
            callbacks_invoked: c[CallbackInvoked as usize],
            live_threads,
        }
    }

    /// Objects allocated and not yet deallocated (immortals included)
    pub fn live_objects(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }
}
