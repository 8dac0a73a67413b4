//! Cache tier: the first stop for every engine operation.
//!
//! Entries live here from their first `store` until evicted under capacity
//! pressure. Eviction is least-recently-used and skips entries that are queued
//! for promotion, so a durable write is never orphaned mid-flight. Eviction
//! only removes the fast copy; promoted data stays in its backend family.

pub mod entry;
pub mod tier;

pub use entry::{CacheEntry, PromotionPolicy, CROSS_CI_PROMOTION_SOURCES};
pub use tier::{AccessOutcome, CacheTier, PutOutcome};
