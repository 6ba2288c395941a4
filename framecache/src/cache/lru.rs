//! Least-recently-used eviction ledger.
//!
//! Each table owns one ledger tracking the size and last-access tick of its
//! committed entries. Ticks come from a per-ledger counter rather than the
//! clock, so ordering is exact even for accesses within the same instant.
//!
//! # Lifecycle
//!
//! The ledger is in-memory only:
//! - Restored entries are inserted in table-of-contents order at startup
//! - Kept in sync via `on_insert()`, `on_access()`, `on_remove()`
//! - `enforce_capacity()` runs on the committing thread after every insert
//!
//! The ledger itself is not synchronized; the owning table calls it with its
//! structural lock held.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone, Copy)]
struct Slot {
    tick: u64,
    size: u64,
}

/// Recency and size ledger for one table.
#[derive(Debug)]
pub struct LruLedger<K> {
    slots: HashMap<K, Slot>,
    /// Access tick to id, oldest first.
    order: BTreeMap<u64, K>,
    total_bytes: u64,
    next_tick: u64,
}

impl<K: Hash + Eq + Clone> Default for LruLedger<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone> LruLedger<K> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            total_bytes: 0,
            next_tick: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Track a new entry as the most recently used.
    ///
    /// Re-inserting a tracked id replaces its size and refreshes it.
    pub fn on_insert(&mut self, id: K, size: u64) {
        self.on_remove(&id);

        let tick = self.tick();
        self.order.insert(tick, id.clone());
        self.slots.insert(id, Slot { tick, size });
        self.total_bytes += size;
    }

    /// Mark an entry as just used. Unknown ids are ignored.
    pub fn on_access(&mut self, id: &K) {
        let tick = self.tick();
        if let Some(slot) = self.slots.get_mut(id) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, id.clone());
        }
    }

    /// Stop tracking an entry.
    ///
    /// # Returns
    ///
    /// The size the entry was tracked with, or `None` if it was unknown.
    pub fn on_remove(&mut self, id: &K) -> Option<u64> {
        let slot = self.slots.remove(id)?;
        self.order.remove(&slot.tick);
        self.total_bytes -= slot.size;
        Some(slot.size)
    }

    /// Evict least recently used entries until the total fits `max_bytes`.
    ///
    /// Entries for which `is_locked` returns true are skipped. If only locked
    /// entries remain the budget stays exceeded until they are released.
    ///
    /// # Returns
    ///
    /// The evicted ids with their sizes, oldest first. They are no longer
    /// tracked.
    pub fn enforce_capacity<F>(&mut self, max_bytes: u64, mut is_locked: F) -> Vec<(K, u64)>
    where
        F: FnMut(&K) -> bool,
    {
        if self.total_bytes <= max_bytes {
            return Vec::new();
        }

        let mut victims = Vec::new();
        let mut freed = 0u64;
        let excess = self.total_bytes - max_bytes;
        for id in self.order.values() {
            if freed >= excess {
                break;
            }
            if is_locked(id) {
                continue;
            }
            if let Some(slot) = self.slots.get(id) {
                freed += slot.size;
                victims.push(id.clone());
            }
        }

        let evicted: Vec<(K, u64)> = victims
            .into_iter()
            .filter_map(|id| self.on_remove(&id).map(|size| (id, size)))
            .collect();

        if self.total_bytes > max_bytes {
            tracing::warn!(
                total_bytes = self.total_bytes,
                max_bytes = max_bytes,
                remaining_entries = self.slots.len(),
                "Cache over budget, all remaining entries are locked"
            );
        }

        evicted
    }

    /// Ids from least to most recently used.
    pub fn lru_order(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.slots.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(evicted: &[(u64, u64)]) -> Vec<u64> {
        evicted.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_insert_tracks_size() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 100);
        ledger.on_insert(2u64, 50);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.total_bytes(), 150);
        assert!(ledger.contains(&1));
    }

    #[test]
    fn test_reinsert_replaces_size() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 100);
        ledger.on_insert(1u64, 30);

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.total_bytes(), 30);
    }

    #[test]
    fn test_remove() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 100);

        assert_eq!(ledger.on_remove(&1), Some(100));
        assert_eq!(ledger.on_remove(&1), None);
        assert_eq!(ledger.total_bytes(), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_access_moves_to_back() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 10);
        ledger.on_insert(2u64, 10);
        ledger.on_insert(3u64, 10);
        ledger.on_access(&1);

        let order: Vec<u64> = ledger.lru_order().copied().collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_access_unknown_is_ignored() {
        let mut ledger: LruLedger<u64> = LruLedger::new();
        ledger.on_access(&42);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_under_budget_evicts_nothing() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 40);
        ledger.on_insert(2u64, 60);

        assert!(ledger.enforce_capacity(100, |_| false).is_empty());
    }

    #[test]
    fn test_evicts_least_recent_first() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 60);
        ledger.on_insert(2u64, 50);

        let evicted = ledger.enforce_capacity(100, |_| false);

        assert_eq!(evicted, vec![(1, 60)]);
        assert_eq!(ledger.total_bytes(), 50);
    }

    #[test]
    fn test_evicts_only_as_much_as_needed() {
        let mut ledger = LruLedger::new();
        for id in 1..=5u64 {
            ledger.on_insert(id, 10);
        }
        ledger.on_access(&1);

        let evicted = ledger.enforce_capacity(25, |_| false);

        assert_eq!(ids(&evicted), vec![2, 3, 4]);
        assert_eq!(ledger.total_bytes(), 20);
    }

    #[test]
    fn test_locked_entries_are_skipped() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 60);
        ledger.on_insert(2u64, 50);
        ledger.on_insert(3u64, 10);

        let evicted = ledger.enforce_capacity(70, |id| *id == 1);

        assert_eq!(ids(&evicted), vec![2]);
        assert!(ledger.contains(&1));
        assert_eq!(ledger.total_bytes(), 70);
    }

    #[test]
    fn test_all_locked_stays_over_budget() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 60);
        ledger.on_insert(2u64, 50);

        let evicted = ledger.enforce_capacity(100, |_| true);

        assert!(evicted.is_empty());
        assert_eq!(ledger.total_bytes(), 110);
    }

    #[test]
    fn test_clear() {
        let mut ledger = LruLedger::new();
        ledger.on_insert(1u64, 60);
        ledger.clear();

        assert!(ledger.is_empty());
        assert_eq!(ledger.total_bytes(), 0);
        assert_eq!(ledger.lru_order().count(), 0);
    }
}
