//! Cache statistics.
//!
//! Counters are kept locally for snapshots and mirrored into the `metrics`
//! facade. Nothing in the cache reads them to make decisions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use super::error::CacheError;

pub const METRIC_HIT_TOTAL: &str = "tagcache_hit_total";
pub const METRIC_MISS_TOTAL: &str = "tagcache_miss_total";
pub const METRIC_SET_TOTAL: &str = "tagcache_set_total";
pub const METRIC_DELETE_TOTAL: &str = "tagcache_delete_total";
pub const METRIC_ERROR_TOTAL: &str = "tagcache_error_total";
pub const METRIC_WRITE_DROPPED_TOTAL: &str = "tagcache_write_dropped_total";
pub const METRIC_STORE_AVAILABLE: &str = "tagcache_store_available";
pub const METRIC_INVALIDATE_KEYS: &str = "tagcache_invalidate_keys";

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT_TOTAL).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS_TOTAL).increment(1);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_SET_TOTAL).increment(1);
    }

    pub fn record_deletes(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.deletes.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_DELETE_TOTAL).increment(count);
    }

    pub fn record_error(&self, error: &CacheError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ERROR_TOTAL, "kind" => error.kind()).increment(1);
    }

    pub fn record_invalidation(&self, keys: u64) {
        histogram!(METRIC_INVALIDATE_KEYS).record(keys as f64);
        self.record_deletes(keys);
    }

    pub fn record_availability(&self, available: bool) {
        gauge!(METRIC_STORE_AVAILABLE).set(if available { 1.0 } else { 0.0 });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        StatsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    /// Log a snapshot every `interval` until the handle is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                ticker.tick().await;
                let snapshot = stats.snapshot();
                info!(
                    target = "tagcache::cache::stats",
                    hits = snapshot.hits,
                    misses = snapshot.misses,
                    sets = snapshot.sets,
                    deletes = snapshot.deletes,
                    errors = snapshot.errors,
                    hit_rate = snapshot.hit_rate,
                    "Cache statistics"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_and_hit_rate() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_set();
        stats.record_deletes(2);
        stats.record_error(&CacheError::connection("down"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.sets, 1);
        assert_eq!(snapshot.deletes, 2);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_have_zero_hit_rate() {
        let snapshot = CacheStats::new().snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);
    }

    #[test]
    fn reset_clears_counters() {
        let stats = CacheStats::new();
        stats.record_miss();
        stats.record_invalidation(4);
        stats.reset();
        assert_eq!(stats.snapshot().misses, 0);
        assert_eq!(stats.snapshot().deletes, 0);
    }
}
