//! Fixed-capacity LRU cache tier.
//!
//! All state sits behind a single mutex, so every field mutation on an entry
//! (access counter, caller set, promotion flags) happens under mutual
//! exclusion and no operation here ever suspends.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use engram_core::{Content, EngramError, EngramResult, Metadata, Timestamp};

use super::entry::{CacheEntry, PromotionPolicy};

/// Result of inserting into the tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: String,
    /// False when the key was already resident.
    pub inserted: bool,
    /// Keys evicted to make room.
    pub evicted: Vec<String>,
}

/// Result of an accounted read.
#[derive(Debug, Clone)]
pub struct AccessOutcome {
    /// Entry state after the access was recorded.
    pub entry: CacheEntry,
    /// True when this access claimed the (single) promotion slot for the key.
    pub promotion_claimed: bool,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Debug, Default)]
struct TierState {
    slots: HashMap<String, Slot>,
    /// Recency order: oldest tick first.
    recency: BTreeMap<u64, String>,
    tick: u64,
    evictions: u64,
}

impl TierState {
    fn bump(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    /// Evict the least recently used entry that is not pending promotion.
    fn evict_one(&mut self) -> Option<String> {
        let victim = self.recency.iter().find_map(|(tick, key)| {
            let slot = self.slots.get(key)?;
            (!slot.entry.is_pending()).then(|| (*tick, key.clone()))
        })?;
        self.recency.remove(&victim.0);
        self.slots.remove(&victim.1);
        self.evictions += 1;
        Some(victim.1)
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.entry)
    }
}

/// The fast front tier every operation consults first.
#[derive(Debug)]
pub struct CacheTier {
    capacity: usize,
    policy: PromotionPolicy,
    state: Mutex<TierState>,
}

impl CacheTier {
    pub fn new(capacity: usize, policy: PromotionPolicy) -> Self {
        Self {
            capacity,
            policy,
            state: Mutex::new(TierState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> PromotionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().slots.contains_key(key)
    }

    /// Total evictions since construction.
    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    /// Store content under `key`.
    ///
    /// A resident key is not overwritten: the caller is added to its sources
    /// and its recency refreshed. Fails only when the tier is full and every
    /// resident entry is pending promotion.
    pub fn put(
        &self,
        key: String,
        content: Content,
        content_type: String,
        metadata: Metadata,
        ci_id: Option<&str>,
    ) -> EngramResult<PutOutcome> {
        let entry = CacheEntry::new(key, content, content_type, metadata, ci_id);
        self.insert(entry, ci_id)
    }

    /// Re-admit a record read back from durable storage. It is marked promoted
    /// so it is never scheduled again.
    pub fn put_promoted(
        &self,
        key: String,
        content: Content,
        content_type: String,
        metadata: Metadata,
        ci_id: Option<&str>,
    ) -> EngramResult<PutOutcome> {
        let mut entry = CacheEntry::new(key, content, content_type, metadata, ci_id);
        entry.promoted = true;
        entry.scheduled = true;
        self.insert(entry, ci_id)
    }

    fn insert(&self, entry: CacheEntry, ci_id: Option<&str>) -> EngramResult<PutOutcome> {
        let mut state = self.lock();
        let key = entry.key.clone();

        if let Some(slot) = state.slots.get_mut(&key) {
            if let Some(ci) = ci_id {
                slot.entry.ci_sources.insert(ci.to_string());
            }
            if entry.promoted {
                slot.entry.promoted = true;
                slot.entry.scheduled = true;
            }
            state.bump(&key);
            return Ok(PutOutcome {
                key,
                inserted: false,
                evicted: Vec::new(),
            });
        }

        let mut evicted = Vec::new();
        while state.slots.len() >= self.capacity {
            match state.evict_one() {
                Some(victim) => evicted.push(victim),
                None => {
                    return Err(EngramError::CacheFull {
                        capacity: self.capacity,
                    })
                }
            }
        }

        state.tick += 1;
        let tick = state.tick;
        state.recency.insert(tick, key.clone());
        state.slots.insert(key.clone(), Slot { entry, tick });

        Ok(PutOutcome {
            key,
            inserted: true,
            evicted,
        })
    }

    /// Read content, recording the access. Never claims promotion.
    pub fn get(&self, key: &str, ci_id: Option<&str>) -> Option<Content> {
        self.access(key, ci_id, false).map(|o| o.entry.content)
    }

    /// Read an entry, recording the access, and atomically claim promotion
    /// when the entry has just become eligible. At most one caller ever
    /// observes `promotion_claimed == true` for a given key.
    pub fn touch(&self, key: &str, ci_id: Option<&str>) -> Option<AccessOutcome> {
        self.access(key, ci_id, true)
    }

    fn access(&self, key: &str, ci_id: Option<&str>, claim: bool) -> Option<AccessOutcome> {
        let mut state = self.lock();
        let policy = self.policy;
        let slot = state.slots.get_mut(key)?;
        slot.entry.record_access(ci_id);

        let promotion_claimed = claim && policy.should_schedule(&slot.entry);
        if promotion_claimed {
            slot.entry.scheduled = true;
        }
        let entry = slot.entry.clone();
        state.bump(key);

        Some(AccessOutcome {
            entry,
            promotion_claimed,
        })
    }

    /// Snapshot an entry without recording an access.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Mark a key durable. Returns true only on the false-to-true transition.
    pub fn mark_promoted(&self, key: &str) -> bool {
        let mut state = self.lock();
        match state.slots.get_mut(key) {
            Some(slot) if !slot.entry.promoted => {
                slot.entry.promoted = true;
                slot.entry.scheduled = true;
                true
            }
            _ => false,
        }
    }

    /// Give up a promotion claim that could not be fulfilled, making the entry
    /// evictable again. Promoted entries are left untouched.
    pub fn release_claim(&self, key: &str) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(key) {
            if !slot.entry.promoted {
                slot.entry.scheduled = false;
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.lock().remove(key)
    }

    /// Drop entries idle since before `cutoff`. Pending entries are kept.
    pub fn remove_idle(&self, cutoff: Timestamp) -> Vec<String> {
        let mut state = self.lock();
        let idle: Vec<String> = state
            .slots
            .values()
            .filter(|slot| slot.entry.last_accessed_at < cutoff && !slot.entry.is_pending())
            .map(|slot| slot.entry.key.clone())
            .collect();
        for key in &idle {
            state.remove(key);
        }
        idle
    }

    /// Visit every entry under the lock, collecting whatever `f` returns.
    pub fn scan<T>(&self, mut f: impl FnMut(&CacheEntry) -> Option<T>) -> Vec<T> {
        let state = self.lock();
        state.slots.values().filter_map(|slot| f(&slot.entry)).collect()
    }

    /// Clone every entry, least recently used first.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let state = self.lock();
        state
            .recency
            .values()
            .filter_map(|key| state.slots.get(key).map(|slot| slot.entry.clone()))
            .collect()
    }
}
