use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node cache statistics
#[derive(Debug, Default)]
pub struct IvStats {
    pub fetch_hits: AtomicU64,
    pub fetch_misses: AtomicU64,
    pub forwards: AtomicU64,
    pub refreshes: AtomicU64,
    pub invalidations: AtomicU64,
}

impl IvStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.fetch_hits.load(Ordering::Relaxed) as f64;
        let misses = self.fetch_misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetch_hits: self.fetch_hits.load(Ordering::Relaxed),
            fetch_misses: self.fetch_misses.load(Ordering::Relaxed),
            forwards: self.forwards.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`IvStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub fetch_hits: u64,
    pub fetch_misses: u64,
    pub forwards: u64,
    pub refreshes: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
}
