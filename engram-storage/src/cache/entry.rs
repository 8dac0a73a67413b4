//! Cache entries and the promotion predicate.

use std::collections::BTreeSet;

use chrono::Utc;
use engram_core::{canonical_string, Content, Metadata, Timestamp};
use serde::Serialize;

/// A single item held in the cache tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub content: Content,
    pub content_type: String,
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    /// Incremented on every retrieve, never on store.
    pub access_count: u64,
    /// Distinct callers that stored or read this entry. Only grows.
    pub ci_sources: BTreeSet<String>,
    /// Set once a durable write completed. Never reset.
    pub promoted: bool,
    /// Set when a promotion task was claimed for this key.
    pub scheduled: bool,
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(
        key: String,
        content: Content,
        content_type: String,
        metadata: Metadata,
        ci_id: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = canonical_string(&content).len();
        let mut ci_sources = BTreeSet::new();
        if let Some(ci) = ci_id {
            ci_sources.insert(ci.to_string());
        }
        Self {
            key,
            content,
            content_type,
            metadata,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ci_sources,
            promoted: false,
            scheduled: false,
            size_bytes,
        }
    }

    /// Queued for promotion but not yet durable. Pending entries are never evicted.
    pub fn is_pending(&self) -> bool {
        self.scheduled && !self.promoted
    }

    /// Age in seconds, floored at one second.
    pub fn age_seconds(&self, now: Timestamp) -> f64 {
        let millis = now.signed_duration_since(self.created_at).num_milliseconds();
        (millis as f64 / 1000.0).max(1.0)
    }

    /// Accesses per second of age.
    pub fn access_velocity(&self, now: Timestamp) -> f64 {
        self.access_count as f64 / self.age_seconds(now)
    }

    pub(crate) fn record_access(&mut self, ci_id: Option<&str>) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
        if let Some(ci) = ci_id {
            self.ci_sources.insert(ci.to_string());
        }
    }
}

/// Decides when an entry has earned a durable copy.
///
/// An entry qualifies once it was read `threshold` times or was touched by at
/// least two distinct callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionPolicy {
    pub threshold: u64,
}

/// Distinct callers required before cross-CI promotion kicks in.
pub const CROSS_CI_PROMOTION_SOURCES: usize = 2;

impl PromotionPolicy {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn is_eligible(&self, entry: &CacheEntry) -> bool {
        entry.access_count >= self.threshold
            || entry.ci_sources.len() >= CROSS_CI_PROMOTION_SOURCES
    }

    /// Eligible and not yet claimed or promoted.
    pub fn should_schedule(&self, entry: &CacheEntry) -> bool {
        !entry.promoted && !entry.scheduled && self.is_eligible(entry)
    }
}
