//! Cache statistics tracking and reporting.

use std::time::Instant;

use super::types::StoragePolicy;

/// Statistics for one cache table.
///
/// Counters accumulate for the lifetime of the table; occupancy fields are
/// filled in when a snapshot is taken with [`CacheTable::stats`](super::CacheTable::stats).
#[derive(Debug, Clone)]
pub struct CacheStats {
    // Lookup metrics
    pub hits: u64,
    pub misses: u64,
    pub coalesced_waits: u64,

    // Producer metrics
    pub commits: u64,
    pub aborts: u64,
    pub memory_fallbacks: u64,

    // Eviction metrics
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub idle_unmaps: u64,

    // Persistence
    pub restored_entries: u64,

    // Occupancy (snapshot only)
    pub entry_count: usize,
    pub pending_count: usize,
    pub resident_bytes: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub max_bytes: u64,
    pub policy: StoragePolicy,

    // Timing
    pub created_at: Instant,
}

impl CacheStats {
    /// Create a new statistics tracker.
    pub fn new(policy: StoragePolicy) -> Self {
        Self {
            hits: 0,
            misses: 0,
            coalesced_waits: 0,
            commits: 0,
            aborts: 0,
            memory_fallbacks: 0,
            evictions: 0,
            evicted_bytes: 0,
            idle_unmaps: 0,
            restored_entries: 0,
            entry_count: 0,
            pending_count: 0,
            resident_bytes: 0,
            memory_bytes: 0,
            disk_bytes: 0,
            max_bytes: 0,
            policy,
            created_at: Instant::now(),
        }
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Share of the budget in use (may exceed 1.0 while locked entries pin it).
    pub fn utilization(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.resident_bytes as f64 / self.max_bytes as f64
        }
    }

    /// Get the uptime duration since statistics started.
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Record a lookup that found the entry still being produced.
    pub fn record_coalesced_wait(&mut self) {
        self.coalesced_waits += 1;
    }

    pub fn record_commit(&mut self) {
        self.commits += 1;
    }

    pub fn record_abort(&mut self) {
        self.aborts += 1;
    }

    /// Record a disk allocation that fell back to a heap buffer.
    pub fn record_memory_fallback(&mut self) {
        self.memory_fallbacks += 1;
    }

    pub fn record_evictions(&mut self, count: u64, bytes: u64) {
        self.evictions += count;
        self.evicted_bytes += bytes;
    }

    pub fn record_idle_unmaps(&mut self, count: u64) {
        self.idle_unmaps += count;
    }

    pub fn record_restored(&mut self, count: u64) {
        self.restored_entries += count;
    }
}

/// Bytes a single holder occupies in a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolderUsage {
    pub entries: usize,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl HolderUsage {
    pub fn total_bytes(&self) -> u64 {
        self.memory_bytes + self.disk_bytes
    }
}

impl std::ops::AddAssign for HolderUsage {
    fn add_assign(&mut self, other: Self) {
        self.entries += other.entries;
        self.memory_bytes += other.memory_bytes;
        self.disk_bytes += other.disk_bytes;
    }
}
