//! Cache entries and the handles that pin them.
//!
//! An entry starts `Pending` when a lookup misses and the caller receives a
//! claim. The claimant fills it and commits, moving it to `Ready` exactly
//! once, or abandons it (`Aborted`). Waiters block on the entry's condvar
//! until it settles.
//!
//! # Locking
//!
//! Every [`EntryHandle`] holds one lock on its entry, and locked entries are
//! never evicted or unmapped. The entry itself is shared through `Arc`: a
//! table that drops an entry while handles are still out only forgets it;
//! the storage is freed when the last handle goes away.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use super::fd_budget::SharedFdBudget;
use super::key::CacheKey;
use super::params::EntryParams;
use super::storage::EntryStorage;
use super::types::CacheError;

/// Table-unique entry identifier.
pub type EntryId = u64;

/// Lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    /// Claimed, producer still working.
    Pending,
    /// Committed; payload and params are final.
    Ready,
    /// Producer gave up; the entry was removed.
    Aborted,
}

#[derive(Debug)]
struct EntryState {
    phase: EntryPhase,
    locks: usize,
}

/// One cached result: key, params, payload and its lock state.
#[derive(Debug)]
pub struct CacheEntry<K, P> {
    id: EntryId,
    key: K,
    hash: u64,
    params: OnceLock<Arc<P>>,
    storage: RwLock<Option<EntryStorage>>,
    size: AtomicU64,
    state: Mutex<EntryState>,
    settled: Condvar,
}

impl<K, P> CacheEntry<K, P> {
    /// A claimed entry with no payload yet.
    pub(crate) fn pending(id: EntryId, key: K, hash: u64) -> Self {
        Self {
            id,
            key,
            hash,
            params: OnceLock::new(),
            storage: RwLock::new(None),
            size: AtomicU64::new(0),
            state: Mutex::new(EntryState {
                phase: EntryPhase::Pending,
                locks: 0,
            }),
            settled: Condvar::new(),
        }
    }

    /// A committed, unlocked entry, as rebuilt from the table of contents.
    pub(crate) fn ready(id: EntryId, key: K, hash: u64, params: P, storage: EntryStorage) -> Self {
        let entry = Self::pending(id, key, hash);
        entry.fill(Arc::new(params), storage);
        entry.state.lock().phase = EntryPhase::Ready;
        entry
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Fingerprint of the key.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Payload size in bytes; 0 until committed.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Params, once committed.
    pub fn params(&self) -> Option<Arc<P>> {
        self.params.get().cloned()
    }

    pub fn phase(&self) -> EntryPhase {
        self.state.lock().phase
    }

    pub fn lock_count(&self) -> usize {
        self.state.lock().locks
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// Add one lock. Returns the new count.
    pub(crate) fn lock(&self) -> usize {
        let mut state = self.state.lock();
        state.locks += 1;
        state.locks
    }

    /// Drop one lock. Returns the remaining count.
    ///
    /// # Errors
    ///
    /// `NotLocked` if the entry holds no lock; the count never goes below 0.
    pub fn unlock(&self) -> Result<usize, CacheError> {
        let mut state = self.state.lock();
        if state.locks == 0 {
            return Err(CacheError::NotLocked { entry_id: self.id });
        }
        state.locks -= 1;
        Ok(state.locks)
    }

    /// Install the committed params and payload.
    pub(crate) fn fill(&self, params: Arc<P>, storage: EntryStorage) {
        self.size.store(storage.len() as u64, Ordering::Release);
        *self.storage.write() = Some(storage);
        // A pending entry is filled once, by its single claimant.
        let _ = self.params.set(params);
    }

    pub(crate) fn mark_ready(&self) {
        let mut state = self.state.lock();
        state.phase = EntryPhase::Ready;
        self.settled.notify_all();
    }

    pub(crate) fn mark_aborted(&self) {
        let mut state = self.state.lock();
        if state.phase == EntryPhase::Pending {
            state.phase = EntryPhase::Aborted;
        }
        self.settled.notify_all();
    }

    /// Block until the entry leaves `Pending` or `shutdown` is raised.
    ///
    /// Returns the phase observed on wake-up; `Pending` means the wait was
    /// cancelled by shutdown.
    pub(crate) fn wait_settled(&self, shutdown: &AtomicBool) -> EntryPhase {
        let mut state = self.state.lock();
        while state.phase == EntryPhase::Pending && !shutdown.load(Ordering::Acquire) {
            self.settled.wait(&mut state);
        }
        state.phase
    }

    /// Wake waiters so they can observe a raised shutdown flag.
    pub(crate) fn notify_shutdown(&self) {
        let _state = self.state.lock();
        self.settled.notify_all();
    }

    /// Whether the payload is addressable without remapping.
    pub(crate) fn is_mapped(&self) -> bool {
        self.storage.read().as_ref().map_or(true, EntryStorage::is_mapped)
    }

    pub(crate) fn is_disk(&self) -> bool {
        self.storage.read().as_ref().map_or(false, EntryStorage::is_disk)
    }

    pub(crate) fn ensure_mapped(&self, budget: &SharedFdBudget) -> Result<(), CacheError> {
        match self.storage.write().as_mut() {
            Some(storage) => storage.ensure_mapped(budget),
            None => Ok(()),
        }
    }

    /// Unmap idle disk storage. Returns `true` if a mapping was dropped.
    pub(crate) fn unmap(&self) -> bool {
        self.storage.write().as_mut().map_or(false, EntryStorage::unmap)
    }

    pub(crate) fn take_storage(&self) -> Option<EntryStorage> {
        self.storage.write().take()
    }

    /// Keep the payload readable and its disk file in place after the
    /// entry leaves the table.
    pub(crate) fn persist_storage(&self) -> Result<(), CacheError> {
        match self.storage.write().as_mut() {
            Some(storage) => storage.persist(),
            None => Ok(()),
        }
    }

    pub(crate) fn location(&self) -> Option<std::path::PathBuf> {
        self.storage
            .read()
            .as_ref()
            .and_then(|storage| storage.location().map(|path| path.to_path_buf()))
    }

    /// Heap and disk bytes held by the payload.
    pub fn footprint(&self) -> (u64, u64) {
        self.storage.read().as_ref().map_or((0, 0), |storage| {
            (storage.memory_footprint(), storage.disk_footprint())
        })
    }
}

fn storage_bytes(storage: &Option<EntryStorage>) -> &[u8] {
    match storage {
        Some(storage) => storage.as_bytes(),
        None => &[],
    }
}

/// Scoped access to a committed entry.
///
/// Holds one lock on the entry for as long as it lives; dropping the handle
/// releases it.
#[derive(Debug)]
pub struct EntryHandle<K: CacheKey, P: EntryParams> {
    entry: Arc<CacheEntry<K, P>>,
    params: Arc<P>,
    released: bool,
}

impl<K: CacheKey, P: EntryParams> EntryHandle<K, P> {
    /// Wrap an entry the caller has already locked.
    pub(crate) fn new(entry: Arc<CacheEntry<K, P>>, params: Arc<P>) -> Self {
        Self {
            entry,
            params,
            released: false,
        }
    }

    pub fn key(&self) -> &K {
        self.entry.key()
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn size(&self) -> u64 {
        self.entry.size()
    }

    /// The payload bytes.
    ///
    /// Holds a read lock on the entry's storage; drop the guard before
    /// touching the table from the same thread for long periods.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.entry.storage.read(), storage_bytes)
    }

    /// The underlying entry.
    pub fn entry(&self) -> &Arc<CacheEntry<K, P>> {
        &self.entry
    }

    /// Release the lock now instead of on drop.
    pub fn release(mut self) -> Result<(), CacheError> {
        self.released = true;
        self.entry.unlock().map(|_| ())
    }
}

impl<K: CacheKey, P: EntryParams> Drop for EntryHandle<K, P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.entry.unlock() {
            tracing::debug!(error = %e, "Entry handle dropped without a lock to release");
        }
    }
}
