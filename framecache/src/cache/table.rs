//! Concurrent, size-bounded cache table.
//!
//! A [`CacheTable`] maps keys to entries and makes sure at most one caller
//! produces the value for a key at a time.
//!
//! # Claim protocol
//!
//! ```text
//! get(key) ──► Ready entry   ──► Hit(handle)       locked until dropped
//!          ──► no entry      ──► Miss(claim)       caller must produce
//!          ──► Pending entry ──► InProgress        or wait: get_or_wait()
//!
//! claim ──► allocate() ──► write payload ──► commit() ──► Ready, waiters woken
//!       └─► abort_claim() / drop ─────────────────────► removed, waiters retry
//! ```
//!
//! # Locking
//!
//! One structural mutex guards the entry map, the fingerprint buckets and the
//! LRU ledger. Locks are always taken in the order structural lock, entry
//! state, entry storage. Evicted entries are dropped after the structural
//! lock is released, so file deletion never happens under it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::entry::{CacheEntry, EntryHandle, EntryId, EntryPhase};
use super::fd_budget::SharedFdBudget;
use super::key::{CacheKey, HolderId};
use super::layout;
use super::lru::LruLedger;
use super::params::EntryParams;
use super::stats::{CacheStats, HolderUsage};
use super::storage::{DiskStorage, EntryStorage};
use super::toc::{self, TocRecord};
use super::types::{CacheError, TableConfig};

/// Mapped entries unmapped per round when the descriptor budget runs out.
const IDLE_UNMAP_BATCH: usize = 8;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a lookup.
#[derive(Debug)]
pub enum Lookup<K: CacheKey, P: EntryParams> {
    /// The entry is ready; the handle keeps it locked.
    Hit(EntryHandle<K, P>),
    /// Nothing cached; the caller now owns producing it.
    Miss(ClaimToken<K, P>),
    /// Another caller is producing it.
    InProgress,
}

impl<K: CacheKey, P: EntryParams> Lookup<K, P> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss(_))
    }
}

/// Exclusive right to produce the entry for one key.
///
/// Dropping an uncommitted claim aborts it and wakes any waiters.
pub struct ClaimToken<K: CacheKey, P: EntryParams> {
    table: Arc<TableInner<K, P>>,
    entry: Arc<CacheEntry<K, P>>,
    settled: bool,
}

impl<K: CacheKey, P: EntryParams> ClaimToken<K, P> {
    pub fn key(&self) -> &K {
        self.entry.key()
    }

    pub fn hash(&self) -> u64 {
        self.entry.hash()
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry.id()
    }
}

impl<K: CacheKey, P: EntryParams> fmt::Debug for ClaimToken<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimToken")
            .field("table", &self.table.config.name)
            .field("entry_id", &self.entry.id())
            .field("key", self.entry.key())
            .finish()
    }
}

impl<K: CacheKey, P: EntryParams> Drop for ClaimToken<K, P> {
    fn drop(&mut self) {
        if !self.settled {
            self.table.abort_entry(&self.entry);
        }
    }
}

struct TableState<K, P> {
    entries: HashMap<EntryId, Arc<CacheEntry<K, P>>>,
    /// Fingerprint to the ids sharing it.
    buckets: HashMap<u64, Vec<EntryId>>,
    /// Committed entries only; pending ones are never eviction candidates.
    ledger: LruLedger<EntryId>,
}

impl<K: CacheKey, P> TableState<K, P> {
    fn find(&self, hash: u64, key: &K) -> Option<&Arc<CacheEntry<K, P>>> {
        self.buckets
            .get(&hash)?
            .iter()
            .filter_map(|id| self.entries.get(id))
            .find(|entry| entry.key() == key)
    }

    fn insert(&mut self, entry: Arc<CacheEntry<K, P>>) {
        self.buckets.entry(entry.hash()).or_default().push(entry.id());
        self.entries.insert(entry.id(), entry);
    }

    fn remove(&mut self, id: EntryId) -> Option<Arc<CacheEntry<K, P>>> {
        let entry = self.entries.remove(&id)?;
        if let Some(ids) = self.buckets.get_mut(&entry.hash()) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.buckets.remove(&entry.hash());
            }
        }
        self.ledger.on_remove(&id);
        Some(entry)
    }

    /// Evict until the ledger fits `max_bytes`, returning the evicted entries.
    fn enforce_capacity(&mut self, max_bytes: u64) -> Vec<Arc<CacheEntry<K, P>>> {
        let TableState {
            entries, ledger, ..
        } = self;
        let evicted = ledger.enforce_capacity(max_bytes, |id| {
            entries.get(id).map_or(false, |entry| entry.is_locked())
        });

        evicted
            .into_iter()
            .filter_map(|(id, _)| self.remove(id))
            .collect()
    }
}

pub(crate) struct TableInner<K, P> {
    table_id: u64,
    config: TableConfig,
    max_bytes: AtomicU64,
    state: Mutex<TableState<K, P>>,
    fd_budget: SharedFdBudget,
    next_entry_id: AtomicU64,
    shutting_down: AtomicBool,
    stats: Mutex<CacheStats>,
}

impl<K: CacheKey, P: EntryParams> TableInner<K, P> {
    /// Remove a pending entry whose claim was abandoned and wake its waiters.
    fn abort_entry(&self, entry: &Arc<CacheEntry<K, P>>) {
        let removed = {
            let mut state = self.state.lock();
            let still_pending = matches!(
                state.entries.get(&entry.id()),
                Some(current) if Arc::ptr_eq(current, entry)
            );
            if still_pending {
                state.remove(entry.id())
            } else {
                None
            }
        };
        entry.mark_aborted();
        self.stats.lock().record_abort();

        tracing::debug!(
            table = %self.config.name,
            entry_id = entry.id(),
            "Claim aborted"
        );
        drop(removed);
    }

    /// Unmap up to `limit` idle disk entries, least recently used first.
    fn unmap_idle(&self, state: &TableState<K, P>, limit: usize) -> usize {
        let mut unmapped = 0;
        for id in state.ledger.lru_order() {
            if unmapped >= limit {
                break;
            }
            let Some(entry) = state.entries.get(id) else {
                continue;
            };
            if !entry.is_locked() && entry.unmap() {
                unmapped += 1;
            }
        }

        if unmapped > 0 {
            self.stats.lock().record_idle_unmaps(unmapped as u64);
            tracing::debug!(
                table = %self.config.name,
                unmapped = unmapped,
                "Unmapped idle disk entries"
            );
        }
        unmapped
    }

    /// Map a locked entry's storage, freeing descriptors from idle entries
    /// if the budget is spent.
    fn ensure_entry_mapped(
        &self,
        state: &TableState<K, P>,
        entry: &CacheEntry<K, P>,
    ) -> Result<(), CacheError> {
        if entry.is_mapped() {
            return Ok(());
        }
        match entry.ensure_mapped(&self.fd_budget) {
            Err(CacheError::FdBudgetExhausted { .. }) => {
                if self.unmap_idle(state, IDLE_UNMAP_BATCH) == 0 {
                    tracing::warn!(
                        table = %self.config.name,
                        budget = self.fd_budget.budget(),
                        "Open file budget exhausted and no idle entry to unmap"
                    );
                }
                entry.ensure_mapped(&self.fd_budget)
            }
            other => other,
        }
    }
}

enum Probe<K: CacheKey, P: EntryParams> {
    Hit(EntryHandle<K, P>),
    Miss(ClaimToken<K, P>),
    Pending(Arc<CacheEntry<K, P>>),
}

/// A keyed, size-bounded, thread-safe cache.
///
/// Cloning is cheap and yields another handle on the same table.
pub struct CacheTable<K, P> {
    inner: Arc<TableInner<K, P>>,
}

impl<K, P> Clone for CacheTable<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P> fmt::Debug for CacheTable<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTable")
            .field("name", &self.inner.config.name)
            .field("policy", &self.inner.config.policy)
            .field("max_bytes", &self.inner.max_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K: CacheKey, P: EntryParams> CacheTable<K, P> {
    /// Create an empty table.
    ///
    /// Disk-backed tables get their shard layout validated (and reset if
    /// invalid). Use [`CacheTable::open`] to restore a previous session.
    pub fn new(config: TableConfig, fd_budget: SharedFdBudget) -> Result<Self, CacheError> {
        config.validate()?;
        if let (true, Some(root)) = (config.policy.uses_disk(), config.root.as_deref()) {
            layout::ensure_structure(root)?;
        }
        Ok(Self::build(config, fd_budget))
    }

    /// Create a table and restore the entries saved by the previous session.
    ///
    /// Files under the root that the table of contents does not reference
    /// are deleted.
    pub fn open(config: TableConfig, fd_budget: SharedFdBudget) -> Result<Self, CacheError> {
        config.validate()?;
        let root = match (config.policy.uses_disk(), config.root.clone()) {
            (true, Some(root)) => root,
            _ => return Ok(Self::build(config, fd_budget)),
        };

        let records: Vec<TocRecord<K, P>> = toc::load_toc(&root, config.version)?;
        let table = Self::build(config, fd_budget);
        let referenced = table.restore(&root, records);
        toc::sweep_unreferenced(&root, &referenced);

        Ok(table)
    }

    fn build(config: TableConfig, fd_budget: SharedFdBudget) -> Self {
        tracing::debug!(
            table = %config.name,
            max_bytes = config.max_bytes,
            policy = ?config.policy,
            "Cache table created"
        );

        let stats = CacheStats::new(config.policy);
        Self {
            inner: Arc::new(TableInner {
                table_id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
                max_bytes: AtomicU64::new(config.max_bytes),
                config,
                state: Mutex::new(TableState {
                    entries: HashMap::new(),
                    buckets: HashMap::new(),
                    ledger: LruLedger::new(),
                }),
                fd_budget,
                next_entry_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                stats: Mutex::new(stats),
            }),
        }
    }

    /// Reinsert restored records as ready, unlocked entries in record order.
    ///
    /// Returns the absolute paths now owned by the table.
    fn restore(&self, root: &Path, records: Vec<TocRecord<K, P>>) -> HashSet<PathBuf> {
        let mut referenced = HashSet::with_capacity(records.len());
        let mut state = self.inner.state.lock();

        for record in records {
            let path = root.join(&record.location);
            let hash = record.key.hash64();
            if state.find(hash, &record.key).is_some() || !referenced.insert(path.clone()) {
                continue;
            }

            let storage = EntryStorage::Disk(DiskStorage::restored(path, record.size as usize));
            let id = self.next_entry_id();
            let entry = Arc::new(CacheEntry::ready(id, record.key, hash, record.params, storage));
            state.insert(entry);
            state.ledger.on_insert(id, record.size);
        }

        let restored = state.ledger.len();
        let evicted = state.enforce_capacity(self.max_bytes());
        for entry in &evicted {
            if let Some(path) = entry.location() {
                referenced.remove(&path);
            }
        }
        drop(state);

        self.inner.stats.lock().record_restored(restored as u64);
        tracing::info!(
            table = %self.inner.config.name,
            restored = restored,
            evicted = evicted.len(),
            "Restored cache entries"
        );
        drop(evicted);
        referenced
    }

    fn next_entry_id(&self) -> EntryId {
        self.inner.next_entry_id.fetch_add(1, Ordering::Relaxed)
    }

    fn probe(&self, key: &K) -> Probe<K, P> {
        let hash = key.hash64();
        let mut state = self.inner.state.lock();
        let mut discarded = None;

        if let Some(entry) = state.find(hash, key).cloned() {
            match entry.phase() {
                EntryPhase::Ready => match self.acquire_ready(&mut state, &entry) {
                    Ok(handle) => {
                        drop(state);
                        self.inner.stats.lock().record_hit();
                        return Probe::Hit(handle);
                    }
                    Err(e) => {
                        tracing::warn!(
                            table = %self.inner.config.name,
                            entry_id = entry.id(),
                            error = %e,
                            "Cached entry unusable, treating as miss"
                        );
                        discarded = state.remove(entry.id());
                    }
                },
                EntryPhase::Pending => {
                    drop(state);
                    self.inner.stats.lock().record_coalesced_wait();
                    return Probe::Pending(entry);
                }
                EntryPhase::Aborted => {
                    discarded = state.remove(entry.id());
                }
            }
        }

        let id = self.next_entry_id();
        let entry = Arc::new(CacheEntry::pending(id, key.clone(), hash));
        state.insert(Arc::clone(&entry));
        drop(state);
        drop(discarded);

        self.inner.stats.lock().record_miss();
        tracing::debug!(
            table = %self.inner.config.name,
            entry_id = id,
            hash = format_args!("{hash:016x}"),
            "Claimed entry"
        );

        Probe::Miss(ClaimToken {
            table: Arc::clone(&self.inner),
            entry,
            settled: false,
        })
    }

    /// Lock a ready entry and hand out a handle on it.
    fn acquire_ready(
        &self,
        state: &mut TableState<K, P>,
        entry: &Arc<CacheEntry<K, P>>,
    ) -> Result<EntryHandle<K, P>, CacheError> {
        let Some(params) = entry.params() else {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry {} is ready but has no params", entry.id()),
            )));
        };

        entry.lock();
        if let Err(e) = self.inner.ensure_entry_mapped(state, entry) {
            let _ = entry.unlock();
            return Err(e);
        }

        state.ledger.on_access(&entry.id());
        Ok(EntryHandle::new(Arc::clone(entry), params))
    }

    /// Look up `key` without blocking.
    ///
    /// A miss inserts a pending entry and returns the claim for it; every
    /// other caller sees [`Lookup::InProgress`] until the claim settles.
    pub fn get(&self, key: &K) -> Lookup<K, P> {
        match self.probe(key) {
            Probe::Hit(handle) => Lookup::Hit(handle),
            Probe::Miss(claim) => Lookup::Miss(claim),
            Probe::Pending(_) => Lookup::InProgress,
        }
    }

    /// Look up `key`, waiting while another caller produces it.
    ///
    /// Never returns [`Lookup::InProgress`]. If the producer aborts, the
    /// lookup starts over and this caller may receive the claim.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` if the table is shut down before the entry settles.
    pub fn get_or_wait(&self, key: &K) -> Result<Lookup<K, P>, CacheError> {
        loop {
            if self.inner.shutting_down.load(Ordering::Acquire) {
                return Err(CacheError::ShuttingDown(self.inner.config.name.clone()));
            }

            match self.probe(key) {
                Probe::Hit(handle) => return Ok(Lookup::Hit(handle)),
                Probe::Miss(claim) => return Ok(Lookup::Miss(claim)),
                Probe::Pending(entry) => {
                    if entry.wait_settled(&self.inner.shutting_down) == EntryPhase::Pending {
                        return Err(CacheError::ShuttingDown(self.inner.config.name.clone()));
                    }
                }
            }
        }
    }

    fn assert_owns(&self, claim: &ClaimToken<K, P>) {
        assert_eq!(
            claim.table.table_id, self.inner.table_id,
            "claim for entry {} belongs to another cache table",
            claim.entry.id()
        );
    }

    /// Allocate payload storage for a claimed entry.
    ///
    /// The table's [`StoragePolicy`](super::StoragePolicy) picks the backing.
    /// A disk allocation that fails falls back to a heap buffer.
    ///
    /// # Panics
    ///
    /// If `claim` was issued by another table.
    pub fn allocate(
        &self,
        claim: &ClaimToken<K, P>,
        size: usize,
        prefer_disk: bool,
    ) -> Result<EntryStorage, CacheError> {
        self.assert_owns(claim);

        let config = &self.inner.config;
        if let (true, Some(root)) = (
            config.policy.wants_disk(size as u64, prefer_disk),
            config.root.as_deref(),
        ) {
            match self.allocate_disk(root, claim.hash(), size) {
                Ok(storage) => return Ok(storage),
                Err(e) => {
                    self.inner.stats.lock().record_memory_fallback();
                    tracing::warn!(
                        table = %config.name,
                        bytes = size,
                        error = %e,
                        "Disk allocation failed, falling back to memory"
                    );
                }
            }
        }

        Ok(EntryStorage::allocate_memory(size))
    }

    fn allocate_disk(&self, root: &Path, hash: u64, size: usize) -> Result<EntryStorage, CacheError> {
        match EntryStorage::allocate_disk(root, hash, size, &self.inner.fd_budget) {
            Err(CacheError::FdBudgetExhausted { .. }) => {
                let state = self.inner.state.lock();
                self.inner.unmap_idle(&state, IDLE_UNMAP_BATCH);
                drop(state);
                EntryStorage::allocate_disk(root, hash, size, &self.inner.fd_budget)
            }
            other => other,
        }
    }

    /// Publish a produced entry.
    ///
    /// Moves the entry to ready, wakes waiters and evicts least recently used
    /// unlocked entries until the table fits its budget again. The returned
    /// handle keeps the new entry locked.
    ///
    /// # Errors
    ///
    /// `ClaimRevoked` if the entry was removed (by `remove`, `clear`, ...)
    /// while it was being produced. The storage is released.
    ///
    /// # Panics
    ///
    /// If `claim` was issued by another table.
    pub fn commit(
        &self,
        mut claim: ClaimToken<K, P>,
        params: P,
        storage: EntryStorage,
    ) -> Result<EntryHandle<K, P>, CacheError> {
        self.assert_owns(&claim);
        claim.settled = true;
        let entry = Arc::clone(&claim.entry);
        let size = storage.len() as u64;

        let mut state = self.inner.state.lock();
        let still_claimed = matches!(
            state.entries.get(&entry.id()),
            Some(current) if Arc::ptr_eq(current, &entry)
        );
        if !still_claimed {
            drop(state);
            entry.mark_aborted();
            storage.release();
            tracing::debug!(
                table = %self.inner.config.name,
                entry_id = entry.id(),
                "Commit of revoked claim discarded"
            );
            return Err(CacheError::ClaimRevoked {
                entry_id: entry.id(),
            });
        }

        let params = Arc::new(params);
        entry.fill(Arc::clone(&params), storage);
        entry.lock();
        entry.mark_ready();
        state.ledger.on_insert(entry.id(), size);
        let evicted = state.enforce_capacity(self.max_bytes());
        drop(state);

        let evicted_bytes: u64 = evicted.iter().map(|victim| victim.size()).sum();
        {
            let mut stats = self.inner.stats.lock();
            stats.record_commit();
            stats.record_evictions(evicted.len() as u64, evicted_bytes);
        }
        if !evicted.is_empty() {
            tracing::debug!(
                table = %self.inner.config.name,
                evicted = evicted.len(),
                freed_bytes = evicted_bytes,
                "Evicted entries"
            );
        }
        drop(evicted);

        Ok(EntryHandle::new(entry, params))
    }

    /// Abandon a claim, waking any waiters.
    ///
    /// # Panics
    ///
    /// If `claim` was issued by another table.
    pub fn abort_claim(&self, claim: ClaimToken<K, P>) {
        self.assert_owns(&claim);
        drop(claim);
    }

    /// Release a handle's lock now.
    ///
    /// # Errors
    ///
    /// `NotLocked` if the entry's lock was already released elsewhere.
    pub fn release(&self, handle: EntryHandle<K, P>) -> Result<(), CacheError> {
        handle.release()
    }

    fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheEntry<K, P>) -> bool,
    {
        let mut state = self.inner.state.lock();
        let ids: Vec<EntryId> = state
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.id())
            .collect();
        let removed: Vec<_> = ids.into_iter().filter_map(|id| state.remove(id)).collect();
        drop(state);

        let count = removed.len();
        drop(removed);
        count
    }

    /// Remove the entry for `key`, if any.
    ///
    /// A locked entry is only detached from the table; its storage is freed
    /// when the last handle on it is dropped. A pending entry's claim can no
    /// longer be committed.
    pub fn remove(&self, key: &K) -> bool {
        let hash = key.hash64();
        let removed = {
            let mut state = self.inner.state.lock();
            let id = state.find(hash, key).map(|entry| entry.id());
            id.and_then(|id| state.remove(id))
        };
        removed.is_some()
    }

    /// Remove every entry produced by `holder`.
    pub fn remove_holder(&self, holder: HolderId) -> usize {
        let removed = self.remove_where(|entry| entry.key().holder() == holder);
        tracing::debug!(table = %self.inner.config.name, %holder, removed, "Removed holder entries");
        removed
    }

    /// Remove the entries of `holder` that were produced from a node state
    /// other than `node_hash`.
    pub fn remove_holder_except(&self, holder: HolderId, node_hash: u64) -> usize {
        let removed = self.remove_where(|entry| {
            entry.key().holder() == holder && entry.key().node_hash() != node_hash
        });
        tracing::debug!(
            table = %self.inner.config.name,
            %holder,
            removed,
            "Removed stale holder entries"
        );
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) -> usize {
        let removed = self.remove_where(|_| true);
        tracing::info!(table = %self.inner.config.name, removed, "Cache table cleared");
        removed
    }

    /// Evict until the table fits its budget again.
    ///
    /// # Returns
    ///
    /// The number of entries evicted.
    pub fn clear_exceeding_entries(&self) -> usize {
        let evicted = {
            let mut state = self.inner.state.lock();
            state.enforce_capacity(self.max_bytes())
        };

        let count = evicted.len();
        let bytes: u64 = evicted.iter().map(|victim| victim.size()).sum();
        self.inner.stats.lock().record_evictions(count as u64, bytes);
        drop(evicted);
        count
    }

    /// Evict the least recently used unlocked entry.
    ///
    /// Returns `false` if every committed entry is locked or the table is
    /// empty.
    pub fn evict_lru(&self) -> bool {
        self.evict_first_where(|_| true)
    }

    /// Evict the least recently used unlocked entry whose payload lives in
    /// process memory. Disk-backed entries are left alone since dropping
    /// them frees no RAM.
    pub fn evict_lru_in_memory(&self) -> bool {
        self.evict_first_where(|entry| entry.footprint().0 > 0)
    }

    fn evict_first_where<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&CacheEntry<K, P>) -> bool,
    {
        let victim = {
            let mut state = self.inner.state.lock();
            let id = state.ledger.lru_order().copied().find(|id| {
                state
                    .entries
                    .get(id)
                    .map_or(false, |entry| !entry.is_locked() && predicate(entry))
            });
            id.and_then(|id| state.remove(id))
        };

        let Some(victim) = victim else {
            return false;
        };
        self.inner.stats.lock().record_evictions(1, victim.size());
        tracing::trace!(
            table = %self.inner.config.name,
            entry_id = victim.id(),
            bytes = victim.size(),
            "Evicted least recently used entry"
        );
        drop(victim);
        true
    }

    /// Change the byte budget, evicting right away if it shrank.
    pub fn set_max_bytes(&self, max_bytes: u64) -> usize {
        let previous = self.inner.max_bytes.swap(max_bytes, Ordering::AcqRel);
        tracing::info!(
            table = %self.inner.config.name,
            previous = previous,
            max_bytes = max_bytes,
            "Cache budget changed"
        );
        self.clear_exceeding_entries()
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes.load(Ordering::Acquire)
    }

    /// Entries and bytes held for `holder`.
    pub fn memory_stats_for_holder(&self, holder: HolderId) -> HolderUsage {
        let state = self.inner.state.lock();
        let mut usage = HolderUsage::default();
        for entry in state.entries.values() {
            if entry.key().holder() != holder || entry.phase() != EntryPhase::Ready {
                continue;
            }
            let (memory_bytes, disk_bytes) = entry.footprint();
            usage += HolderUsage {
                entries: 1,
                memory_bytes,
                disk_bytes,
            };
        }
        usage
    }

    /// Snapshot of the counters plus current occupancy.
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let mut stats = self.inner.stats.lock().clone();

        stats.entry_count = state.ledger.len();
        stats.pending_count = state.entries.len() - state.ledger.len();
        stats.resident_bytes = state.ledger.total_bytes();
        stats.max_bytes = self.max_bytes();
        for entry in state.entries.values() {
            let (memory_bytes, disk_bytes) = entry.footprint();
            stats.memory_bytes += memory_bytes;
            stats.disk_bytes += disk_bytes;
        }
        stats
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by committed entries.
    pub fn resident_bytes(&self) -> u64 {
        self.inner.state.lock().ledger.total_bytes()
    }

    /// Heap bytes held by the table's payloads, including disk allocations
    /// that fell back to memory.
    pub fn memory_bytes(&self) -> u64 {
        let state = self.inner.state.lock();
        state.entries.values().map(|entry| entry.footprint().0).sum()
    }

    /// Whether a committed entry exists for `key`, without touching recency.
    pub fn contains(&self, key: &K) -> bool {
        let state = self.inner.state.lock();
        state
            .find(key.hash64(), key)
            .map_or(false, |entry| entry.phase() == EntryPhase::Ready)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.inner.config
    }

    pub fn fd_budget(&self) -> &SharedFdBudget {
        &self.inner.fd_budget
    }

    /// Cancel every blocked [`get_or_wait`](Self::get_or_wait).
    ///
    /// Waiters return `ShuttingDown`; later calls to `get_or_wait` fail the
    /// same way. Non-blocking lookups keep working.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let pending: Vec<_> = {
            let state = self.inner.state.lock();
            state
                .entries
                .values()
                .filter(|entry| entry.phase() == EntryPhase::Pending)
                .cloned()
                .collect()
        };
        for entry in &pending {
            entry.notify_shutdown();
        }

        tracing::info!(
            table = %self.inner.config.name,
            pending = pending.len(),
            "Cache table shutting down"
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Write the table of contents and hand the disk files over to it.
    ///
    /// Committed disk entries are recorded least recently used first, then
    /// every entry is dropped from the table; disk files stay in place for
    /// the next [`CacheTable::open`]. Memory-only tables have nothing to save.
    ///
    /// Entries still locked by an [`EntryHandle`] keep their payload until
    /// the last handle goes away. On failure the table is left untouched.
    ///
    /// # Returns
    ///
    /// The number of entries saved.
    pub fn save_toc(&self) -> Result<usize, CacheError> {
        let config = &self.inner.config;
        let root = match (config.policy.uses_disk(), config.root.as_deref()) {
            (true, Some(root)) => root,
            _ => return Ok(0),
        };

        let mut state = self.inner.state.lock();
        let mut records = Vec::with_capacity(state.ledger.len());
        for id in state.ledger.lru_order() {
            let Some(entry) = state.entries.get(id) else {
                continue;
            };
            let (Some(params), Some(path)) = (entry.params(), entry.location()) else {
                continue;
            };
            let Ok(location) = path.strip_prefix(root) else {
                continue;
            };
            records.push(TocRecord {
                key: entry.key().clone(),
                params: P::clone(&params),
                location: location.to_path_buf(),
                size: entry.size(),
            });
        }

        if let Err(e) = toc::save_toc(root, config.version, &records) {
            tracing::warn!(table = %config.name, error = %e, "Failed to save table of contents");
            return Err(e);
        }

        let entries: Vec<_> = state.entries.drain().map(|(_, entry)| entry).collect();
        state.buckets.clear();
        state.ledger.clear();
        drop(state);

        for entry in entries {
            let persisted = if entry.is_locked() {
                entry.persist_storage()
            } else {
                match entry.take_storage() {
                    Some(storage) => storage.detach(),
                    None => Ok(()),
                }
            };
            if let Err(e) = persisted {
                tracing::warn!(table = %config.name, error = %e, "Failed to flush cache file");
            }
        }

        Ok(records.len())
    }

    #[cfg(test)]
    fn ledger_order(&self) -> Vec<EntryId> {
        self.inner.state.lock().ledger.lru_order().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fd_budget::FdBudget;
    use crate::cache::key::ImageKey;
    use crate::cache::params::{BitDepth, ChannelLayout, ImageParams, RectI};
    use crate::cache::types::StoragePolicy;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    type Table = CacheTable<ImageKey, ImageParams>;

    fn budget() -> SharedFdBudget {
        Arc::new(FdBudget::with_budget(64))
    }

    fn memory_table(max_bytes: u64) -> Table {
        CacheTable::new(TableConfig::memory("test", max_bytes), budget()).unwrap()
    }

    fn key(node_hash: u64) -> ImageKey {
        ImageKey::new(HolderId(1), node_hash, false, 0.0, 0, 1.0, false)
    }

    fn params() -> ImageParams {
        ImageParams::new(RectI::new(0, 0, 1, 1), BitDepth::Byte, ChannelLayout::Alpha)
    }

    fn claim(table: &Table, key: &ImageKey) -> ClaimToken<ImageKey, ImageParams> {
        match table.get(key) {
            Lookup::Miss(claim) => claim,
            other => panic!("expected miss, got {other:?}"),
        }
    }

    fn insert(table: &Table, key: &ImageKey, size: usize) -> EntryHandle<ImageKey, ImageParams> {
        let claim = claim(table, key);
        let mut storage = table.allocate(&claim, size, false).unwrap();
        storage.as_mut_bytes().fill(0xab);
        table.commit(claim, params(), storage).unwrap()
    }

    // ─── Claim protocol ─────────────────────────────────────────────────────

    #[test]
    fn test_miss_then_hit() {
        let table = memory_table(1000);
        let k = key(1);

        let handle = insert(&table, &k, 10);
        assert_eq!(handle.size(), 10);
        drop(handle);

        match table.get(&k) {
            Lookup::Hit(handle) => {
                assert_eq!(handle.data().len(), 10);
                assert!(handle.data().iter().all(|byte| *byte == 0xab));
            }
            other => panic!("expected hit, got {other:?}"),
        }

        let stats = table.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.commits, 1);
    }

    #[test]
    fn test_pending_entry_reports_in_progress() {
        let table = memory_table(1000);
        let k = key(1);

        let _claim = claim(&table, &k);

        assert!(matches!(table.get(&k), Lookup::InProgress));
        assert!(table.is_empty());
        assert_eq!(table.stats().pending_count, 1);
    }

    #[test]
    fn test_dropping_claim_aborts() {
        let table = memory_table(1000);
        let k = key(1);

        drop(claim(&table, &k));

        assert!(table.get(&k).is_miss());
        assert_eq!(table.stats().aborts, 1);
    }

    #[test]
    fn test_waiter_receives_hit_after_commit() {
        let table = memory_table(1000);
        let k = key(1);
        let claim = claim(&table, &k);

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.get_or_wait(&k).unwrap().is_hit())
        };

        thread::sleep(Duration::from_millis(20));
        let storage = table.allocate(&claim, 4, false).unwrap();
        drop(table.commit(claim, params(), storage).unwrap());

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_waiter_claims_after_abort() {
        let table = memory_table(1000);
        let k = key(1);
        let claim = claim(&table, &k);

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.get_or_wait(&k).unwrap().is_miss())
        };

        thread::sleep(Duration::from_millis(20));
        table.abort_claim(claim);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_shutdown_cancels_waiters() {
        let table = memory_table(1000);
        let k = key(1);
        let _claim = claim(&table, &k);

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.get_or_wait(&k))
        };

        thread::sleep(Duration::from_millis(20));
        table.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(CacheError::ShuttingDown(name)) if name == "test"));
        assert!(table.is_shutting_down());
    }

    #[test]
    fn test_commit_after_remove_is_revoked() {
        let table = memory_table(1000);
        let k = key(1);
        let claim = claim(&table, &k);
        let storage = table.allocate(&claim, 4, false).unwrap();

        assert!(table.remove(&k));
        let result = table.commit(claim, params(), storage);

        assert!(matches!(result, Err(CacheError::ClaimRevoked { .. })));
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic(expected = "belongs to another cache table")]
    fn test_commit_to_other_table_panics() {
        let first = memory_table(1000);
        let second = memory_table(1000);
        let claim = claim(&first, &key(1));
        let storage = EntryStorage::allocate_memory(4);

        let _ = second.commit(claim, params(), storage);
    }

    // ─── Eviction ───────────────────────────────────────────────────────────

    #[test]
    fn test_commit_evicts_least_recently_used() {
        let table = memory_table(100);
        let a = key(1);
        let b = key(2);

        drop(insert(&table, &a, 60));
        drop(insert(&table, &b, 50));

        assert!(!table.contains(&a));
        assert!(table.contains(&b));
        assert_eq!(table.resident_bytes(), 50);
        assert_eq!(table.stats().evictions, 1);
    }

    #[test]
    fn test_hit_refreshes_recency() {
        let table = memory_table(100);
        let a = key(1);
        let b = key(2);
        let c = key(3);

        drop(insert(&table, &a, 40));
        drop(insert(&table, &b, 40));
        assert!(table.get(&a).is_hit());
        drop(insert(&table, &c, 40));

        assert!(table.contains(&a));
        assert!(!table.contains(&b));
        assert!(table.contains(&c));
    }

    #[test]
    fn test_locked_entry_survives_eviction() {
        let table = memory_table(100);
        let a = key(1);
        let b = key(2);

        let held = insert(&table, &a, 60);
        drop(insert(&table, &b, 50));

        assert!(table.contains(&a));
        assert!(!table.contains(&b));
        assert_eq!(&*held.data(), &[0xab; 60][..]);
    }

    #[test]
    fn test_all_locked_exceeds_budget() {
        let table = memory_table(100);

        let _a = insert(&table, &key(1), 60);
        let _b = insert(&table, &key(2), 50);

        assert_eq!(table.len(), 2);
        assert_eq!(table.resident_bytes(), 110);
    }

    #[test]
    fn test_set_max_bytes_evicts() {
        let table = memory_table(1000);
        for hash in 1..=4 {
            drop(insert(&table, &key(hash), 100));
        }

        let evicted = table.set_max_bytes(250);

        assert_eq!(evicted, 2);
        assert_eq!(table.max_bytes(), 250);
        assert!(!table.contains(&key(1)));
        assert!(!table.contains(&key(2)));
        assert!(table.contains(&key(3)));
    }

    #[test]
    fn test_evict_lru_skips_locked_entries() {
        let table = memory_table(1000);
        let held = insert(&table, &key(1), 10);
        drop(insert(&table, &key(2), 20));
        drop(insert(&table, &key(3), 30));

        assert!(table.evict_lru());

        assert!(table.contains(&key(1)));
        assert!(!table.contains(&key(2)));
        assert!(table.contains(&key(3)));
        assert_eq!(table.stats().evictions, 1);
        drop(held);
    }

    #[test]
    fn test_evict_lru_with_everything_locked() {
        let table = memory_table(1000);
        assert!(!table.evict_lru());

        let _held = insert(&table, &key(1), 10);
        assert!(!table.evict_lru());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_evict_lru_in_memory_skips_disk_entries() {
        let dir = TempDir::new().unwrap();
        let config = TableConfig::disk("viewer", 10_000, dir.path().to_path_buf())
            .with_policy(StoragePolicy::Threshold(100));
        let table: Table = CacheTable::new(config, budget()).unwrap();
        drop(insert(&table, &key(1), 200));
        drop(insert(&table, &key(2), 10));
        assert_eq!(table.memory_bytes(), 10);

        assert!(table.evict_lru_in_memory());

        assert!(table.contains(&key(1)));
        assert!(!table.contains(&key(2)));
        assert_eq!(table.memory_bytes(), 0);
        assert!(!table.evict_lru_in_memory());
    }

    // ─── Removal ────────────────────────────────────────────────────────────

    #[test]
    fn test_remove_locked_entry_keeps_handle_valid() {
        let table = memory_table(1000);
        let k = key(1);
        let handle = insert(&table, &k, 8);

        assert!(table.remove(&k));
        assert!(!table.contains(&k));
        assert_eq!(handle.data().len(), 8);
        assert!(handle.release().is_ok());
    }

    #[test]
    fn test_release_twice_is_rejected() {
        let table = memory_table(1000);
        let handle = insert(&table, &key(1), 8);
        let entry = Arc::clone(handle.entry());

        table.release(handle).unwrap();

        assert!(matches!(entry.unlock(), Err(CacheError::NotLocked { .. })));
    }

    #[test]
    fn test_remove_holder() {
        let table = memory_table(1000);
        let mine = ImageKey { holder: HolderId(7), ..key(1) };
        let also_mine = ImageKey { holder: HolderId(7), ..key(2) };
        let other = ImageKey { holder: HolderId(8), ..key(3) };
        for k in [&mine, &also_mine, &other] {
            drop(insert(&table, k, 10));
        }

        assert_eq!(table.memory_stats_for_holder(HolderId(7)).memory_bytes, 20);
        assert_eq!(table.remove_holder(HolderId(7)), 2);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&other));
    }

    #[test]
    fn test_remove_holder_except_current_hash() {
        let table = memory_table(1000);
        let stale = ImageKey { holder: HolderId(7), ..key(1) };
        let current = ImageKey { holder: HolderId(7), ..key(2) };
        drop(insert(&table, &stale, 10));
        drop(insert(&table, &current, 10));

        assert_eq!(table.remove_holder_except(HolderId(7), 2), 1);
        assert!(!table.contains(&stale));
        assert!(table.contains(&current));
    }

    #[test]
    fn test_clear() {
        let table = memory_table(1000);
        drop(insert(&table, &key(1), 10));
        drop(insert(&table, &key(2), 10));

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
        assert_eq!(table.resident_bytes(), 0);
    }

    // ─── Disk storage ───────────────────────────────────────────────────────

    fn disk_table(dir: &TempDir, max_bytes: u64, fd_budget: SharedFdBudget) -> Table {
        let config = TableConfig::disk("disk", max_bytes, dir.path().to_path_buf());
        CacheTable::new(config, fd_budget).unwrap()
    }

    #[test]
    fn test_disk_entry_file_removed_on_eviction() {
        let dir = TempDir::new().unwrap();
        let table = disk_table(&dir, 100, budget());

        let handle = insert(&table, &key(1), 60);
        let path = handle.entry().location().unwrap();
        drop(handle);
        assert!(path.exists());

        drop(insert(&table, &key(2), 50));

        assert!(!path.exists());
    }

    #[test]
    fn test_threshold_policy() {
        let dir = TempDir::new().unwrap();
        let config = TableConfig::disk("viewer", 10_000, dir.path().to_path_buf())
            .with_policy(StoragePolicy::Threshold(100));
        let table: Table = CacheTable::new(config, budget()).unwrap();

        let small = claim(&table, &key(1));
        assert!(!table.allocate(&small, 10, false).unwrap().is_disk());
        assert!(table.allocate(&small, 10, true).unwrap().is_disk());
        assert!(table.allocate(&small, 100, false).unwrap().is_disk());
    }

    #[test]
    fn test_disk_allocation_falls_back_to_memory() {
        let dir = TempDir::new().unwrap();
        let table = disk_table(&dir, 1000, Arc::new(FdBudget::with_budget(1)));

        let _held = insert(&table, &key(1), 10);
        let claim = claim(&table, &key(2));
        let storage = table.allocate(&claim, 10, false).unwrap();

        assert!(!storage.is_disk());
        assert_eq!(table.stats().memory_fallbacks, 1);
    }

    #[test]
    fn test_idle_entries_unmapped_when_budget_exhausted() {
        let dir = TempDir::new().unwrap();
        let fd_budget = Arc::new(FdBudget::with_budget(1));
        let table = disk_table(&dir, 1000, Arc::clone(&fd_budget));

        drop(insert(&table, &key(1), 10));
        let second = insert(&table, &key(2), 10);
        assert!(second.entry().location().is_some());
        assert!(table.stats().idle_unmaps >= 1);
        drop(second);

        match table.get(&key(1)) {
            Lookup::Hit(handle) => assert_eq!(&*handle.data(), &[0xab; 10][..]),
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(fd_budget.current_usage(), 1);
    }

    #[test]
    fn test_lru_order_follows_access() {
        let table = memory_table(1000);
        let first = insert(&table, &key(1), 10).entry().id();
        let second = insert(&table, &key(2), 10).entry().id();
        assert!(table.get(&key(1)).is_hit());

        assert_eq!(table.ledger_order(), vec![second, first]);
    }
}
