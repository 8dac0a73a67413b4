//! Engine counters and cache pattern analysis.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use engram_core::Timestamp;
use serde::Serialize;

use crate::cache::CacheEntry;

/// Monotone engine counters. Each is bumped exactly once per event.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Successful `store` calls
    pub stores: AtomicU64,
    /// `retrieve` calls, hit or miss
    pub retrievals: AtomicU64,
    pub cache_hits: AtomicU64,
    /// Reads served by a backend after a cache miss
    pub backend_hits: AtomicU64,
    /// Completed durable writes
    pub promotions: AtomicU64,
    pub misses: AtomicU64,
    /// Soft failures: backend errors, timeouts, rejected schedules
    pub errors: AtomicU64,
    pub evictions: AtomicU64,
    pub searches: AtomicU64,
    /// Promotions given up after the last retry
    pub dead_letters: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stores: self.stores.load(Ordering::Relaxed),
            retrievals: self.retrievals.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            backend_hits: self.backend_hits.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub stores: u64,
    pub retrievals: u64,
    pub cache_hits: u64,
    pub backend_hits: u64,
    pub promotions: u64,
    pub misses: u64,
    pub errors: u64,
    pub evictions: u64,
    pub searches: u64,
    pub dead_letters: u64,
}

/// Output of `EsrEngine::get_statistics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatistics {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub enabled_backends: Vec<String>,
    pub namespace: String,
}

/// An entry ranked by access velocity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotEntry {
    pub key: String,
    pub content_type: String,
    pub access_count: u64,
    pub ci_sources: usize,
    /// Accesses per second of age
    pub velocity: f64,
    pub promoted: bool,
}

/// Read-only aggregate over the cache tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternAnalysis {
    pub total_entries: usize,
    pub total_accesses: u64,
    pub unique_cis: usize,
    /// Entries queued for promotion but not yet durable
    pub promotion_pending: usize,
    pub type_distribution: BTreeMap<String, usize>,
    pub hot_entries: Vec<HotEntry>,
}

/// Aggregate cache entries, ranking the `limit` fastest-accessed ones.
pub fn analyze_entries(entries: &[CacheEntry], now: Timestamp, limit: usize) -> PatternAnalysis {
    let mut cis: BTreeSet<&str> = BTreeSet::new();
    let mut type_distribution: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_accesses = 0u64;
    let mut promotion_pending = 0usize;

    for entry in entries {
        total_accesses = total_accesses.saturating_add(entry.access_count);
        cis.extend(entry.ci_sources.iter().map(String::as_str));
        *type_distribution.entry(entry.content_type.clone()).or_default() += 1;
        if entry.is_pending() {
            promotion_pending += 1;
        }
    }

    let mut hot_entries: Vec<HotEntry> = entries
        .iter()
        .map(|entry| HotEntry {
            key: entry.key.clone(),
            content_type: entry.content_type.clone(),
            access_count: entry.access_count,
            ci_sources: entry.ci_sources.len(),
            velocity: entry.access_velocity(now),
            promoted: entry.promoted,
        })
        .collect();
    hot_entries.sort_by(|a, b| {
        b.velocity
            .total_cmp(&a.velocity)
            .then_with(|| a.key.cmp(&b.key))
    });
    hot_entries.truncate(limit);

    PatternAnalysis {
        total_entries: entries.len(),
        total_accesses,
        unique_cis: cis.len(),
        promotion_pending,
        type_distribution,
        hot_entries,
    }
}
