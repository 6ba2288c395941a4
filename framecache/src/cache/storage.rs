//! Payload storage for cache entries.
//!
//! An entry's bytes live either in a heap buffer or in a file under the
//! cache root that is memory-mapped read/write. Disk storage can be unmapped
//! while idle and mapped again on demand; each live mapping holds one
//! descriptor from the shared [`FdBudget`](super::FdBudget).
//!
//! Dropping storage frees it: heap buffers are deallocated and disk files are
//! unmapped and deleted. [`EntryStorage::persist`] (or [`EntryStorage::detach`],
//! which also drops the storage) cancels the delete so the table of contents
//! can pick the file up in the next session.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::fd_budget::{FdReservation, SharedFdBudget};
use super::layout;
use super::types::CacheError;

/// How many fingerprint collisions are probed before disk allocation gives up.
pub const MAX_COLLISIONS: u32 = 16;

/// Backing storage of one entry.
#[derive(Debug)]
pub enum EntryStorage {
    Memory(MemoryStorage),
    Disk(DiskStorage),
}

impl EntryStorage {
    /// Allocate a zeroed heap buffer of `size` bytes.
    pub fn allocate_memory(size: usize) -> Self {
        EntryStorage::Memory(MemoryStorage::new(size))
    }

    /// Create and map a file of `size` bytes for the fingerprint `hash`.
    ///
    /// # Errors
    ///
    /// `FdBudgetExhausted` when no descriptor is left, `Io` when the file
    /// cannot be created, sized or mapped.
    pub fn allocate_disk(
        root: &Path,
        hash: u64,
        size: usize,
        budget: &SharedFdBudget,
    ) -> Result<Self, CacheError> {
        DiskStorage::create(root, hash, size, budget).map(EntryStorage::Disk)
    }

    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        match self {
            EntryStorage::Memory(memory) => memory.buffer.len(),
            EntryStorage::Disk(disk) => disk.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disk(&self) -> bool {
        matches!(self, EntryStorage::Disk(_))
    }

    /// Whether the bytes are addressable right now.
    pub fn is_mapped(&self) -> bool {
        match self {
            EntryStorage::Memory(_) => true,
            EntryStorage::Disk(disk) => disk.is_mapped(),
        }
    }

    /// Backing file, for disk storage.
    pub fn location(&self) -> Option<&Path> {
        match self {
            EntryStorage::Memory(_) => None,
            EntryStorage::Disk(disk) => Some(&disk.path),
        }
    }

    /// Bytes held in process memory (heap buffers only).
    pub fn memory_footprint(&self) -> u64 {
        match self {
            EntryStorage::Memory(memory) => memory.buffer.len() as u64,
            EntryStorage::Disk(_) => 0,
        }
    }

    /// Bytes held in files under the cache root.
    pub fn disk_footprint(&self) -> u64 {
        match self {
            EntryStorage::Memory(_) => 0,
            EntryStorage::Disk(disk) => disk.len as u64,
        }
    }

    /// Read view of the payload. Empty while disk storage is unmapped.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            EntryStorage::Memory(memory) => &memory.buffer,
            EntryStorage::Disk(disk) => match disk.mapping.as_ref() {
                Some(mapping) => &mapping.map[..],
                None => &[],
            },
        }
    }

    /// Write view of the payload. Empty while disk storage is unmapped.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        match self {
            EntryStorage::Memory(memory) => &mut memory.buffer,
            EntryStorage::Disk(disk) => match disk.mapping.as_mut() {
                Some(mapping) => &mut mapping.map[..],
                None => &mut [],
            },
        }
    }

    /// Copy `bytes` into the payload at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), CacheError> {
        let capacity = self.len();
        let end = offset.checked_add(bytes.len()).unwrap_or(usize::MAX);
        if end > capacity {
            return Err(CacheError::PayloadTooLarge {
                required: end,
                capacity,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.is_mapped() {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::Other,
                "disk storage is not mapped",
            )));
        }

        self.as_mut_bytes()[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Map disk storage if it is not mapped. No-op for memory storage.
    pub fn ensure_mapped(&mut self, budget: &SharedFdBudget) -> Result<(), CacheError> {
        match self {
            EntryStorage::Memory(_) => Ok(()),
            EntryStorage::Disk(disk) => disk.ensure_mapped(budget),
        }
    }

    /// Unmap disk storage, returning its descriptor to the budget.
    ///
    /// Returns `true` if a mapping was dropped.
    pub fn unmap(&mut self) -> bool {
        match self {
            EntryStorage::Memory(_) => false,
            EntryStorage::Disk(disk) => disk.unmap(),
        }
    }

    /// Free the storage: drop the buffer, or unmap and delete the file.
    pub fn release(self) {
        drop(self);
    }

    /// Flush a disk file and keep it in place when the storage is dropped.
    ///
    /// The bytes stay readable; only the delete-on-drop is cancelled.
    pub fn persist(&mut self) -> Result<(), CacheError> {
        match self {
            EntryStorage::Memory(_) => Ok(()),
            EntryStorage::Disk(disk) => {
                disk.keep_file = true;
                if let Some(mapping) = disk.mapping.as_ref() {
                    mapping.map.flush()?;
                }
                Ok(())
            }
        }
    }

    /// Drop the storage but keep a disk file in place.
    ///
    /// Dirty pages are flushed first so the file holds the full payload.
    pub fn detach(mut self) -> Result<(), CacheError> {
        self.persist()
    }
}

/// Heap-allocated payload.
#[derive(Debug)]
pub struct MemoryStorage {
    buffer: Box<[u8]>,
}

impl MemoryStorage {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size].into_boxed_slice(),
        }
    }
}

/// Live mapping of a disk entry.
#[derive(Debug)]
struct Mapping {
    map: MmapMut,
    _file: File,
    _reservation: FdReservation,
}

/// File-backed payload.
#[derive(Debug)]
pub struct DiskStorage {
    path: PathBuf,
    len: usize,
    mapping: Option<Mapping>,
    keep_file: bool,
}

impl DiskStorage {
    /// Create a new file for `hash` under `root`, size it and map it.
    ///
    /// Probes `-1`, `-2`, ... suffixes when a file for the same fingerprint
    /// already exists.
    pub fn create(
        root: &Path,
        hash: u64,
        len: usize,
        budget: &SharedFdBudget,
    ) -> Result<Self, CacheError> {
        let reservation = reserve(budget)?;

        for collision in 0..MAX_COLLISIONS {
            let path = layout::entry_path(root, hash, collision);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            let mut storage = Self {
                path,
                len,
                mapping: None,
                keep_file: false,
            };
            // From here on, dropping `storage` deletes the file.
            file.set_len(len as u64)?;
            storage.mapping = map_file(file, len, reservation)?;

            tracing::trace!(
                path = %storage.path.display(),
                bytes = len,
                "Created disk entry"
            );
            return Ok(storage);
        }

        Err(CacheError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("too many fingerprint collisions for {hash:016x}"),
        )))
    }

    /// Storage for an existing file, left unmapped until first use.
    pub fn restored(path: PathBuf, len: usize) -> Self {
        Self {
            path,
            len,
            mapping: None,
            keep_file: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some() || self.len == 0
    }

    fn ensure_mapped(&mut self, budget: &SharedFdBudget) -> Result<(), CacheError> {
        if self.is_mapped() {
            return Ok(());
        }

        let reservation = reserve(budget)?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let on_disk = file.metadata()?.len();
        if on_disk != self.len as u64 {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes, expected {}",
                    self.path.display(),
                    on_disk,
                    self.len
                ),
            )));
        }

        self.mapping = map_file(file, self.len, reservation)?;
        Ok(())
    }

    fn unmap(&mut self) -> bool {
        self.mapping.take().is_some()
    }
}

impl Drop for DiskStorage {
    fn drop(&mut self) {
        self.mapping = None;
        if self.keep_file {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to delete cache file"
                );
            }
        }
    }
}

fn reserve(budget: &SharedFdBudget) -> Result<FdReservation, CacheError> {
    FdReservation::try_new(SharedFdBudget::clone(budget), 1).ok_or_else(|| {
        CacheError::FdBudgetExhausted {
            in_use: budget.current_usage(),
            budget: budget.budget(),
        }
    })
}

/// Map `len` bytes of `file`. Zero-length files are never mapped.
fn map_file(
    file: File,
    len: usize,
    reservation: FdReservation,
) -> Result<Option<Mapping>, CacheError> {
    if len == 0 {
        return Ok(None);
    }

    // SAFETY: the file is private to this cache root and only this process
    // resizes or deletes it, which happens after the mapping is dropped.
    let map = unsafe { MmapMut::map_mut(&file)? };

    Ok(Some(Mapping {
        map,
        _file: file,
        _reservation: reservation,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fd_budget::FdBudget;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn disk_root() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        layout::create_structure(temp_dir.path()).unwrap();
        temp_dir
    }

    #[test]
    fn test_memory_storage_write_and_read() {
        let mut storage = EntryStorage::allocate_memory(8);
        storage.write(2, &[1, 2, 3]).unwrap();

        assert_eq!(storage.as_bytes(), &[0, 0, 1, 2, 3, 0, 0, 0]);
        assert_eq!(storage.memory_footprint(), 8);
        assert_eq!(storage.disk_footprint(), 0);
        assert!(!storage.is_disk());
    }

    #[test]
    fn test_write_past_end_fails() {
        let mut storage = EntryStorage::allocate_memory(4);
        let result = storage.write(2, &[1, 2, 3]);

        assert!(matches!(
            result,
            Err(CacheError::PayloadTooLarge {
                required: 5,
                capacity: 4
            })
        ));
    }

    #[test]
    fn test_disk_storage_creates_sharded_file() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(8));
        let hash = 0x4200_0000_0000_00aa;

        let mut storage = EntryStorage::allocate_disk(root.path(), hash, 16, &budget).unwrap();
        storage.write(0, b"framecache-bytes").unwrap();

        let path = storage.location().unwrap().to_path_buf();
        assert_eq!(path, layout::entry_path(root.path(), hash, 0));
        assert_eq!(fs::metadata(&path).unwrap().len(), 16);
        assert_eq!(storage.as_bytes(), b"framecache-bytes");
        assert_eq!(storage.disk_footprint(), 16);
        assert_eq!(budget.current_usage(), 1);
    }

    #[test]
    fn test_release_deletes_file() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(8));

        let storage = EntryStorage::allocate_disk(root.path(), 7, 32, &budget).unwrap();
        let path = storage.location().unwrap().to_path_buf();
        storage.release();

        assert!(!path.exists());
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_detach_keeps_file_contents() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(8));

        let mut storage = EntryStorage::allocate_disk(root.path(), 9, 4, &budget).unwrap();
        storage.write(0, &[9, 8, 7, 6]).unwrap();
        let path = storage.location().unwrap().to_path_buf();
        storage.detach().unwrap();

        assert_eq!(fs::read(&path).unwrap(), vec![9, 8, 7, 6]);
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_persist_keeps_bytes_readable() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(8));

        let mut storage = EntryStorage::allocate_disk(root.path(), 10, 2, &budget).unwrap();
        storage.write(0, &[4, 2]).unwrap();
        let path = storage.location().unwrap().to_path_buf();
        storage.persist().unwrap();

        assert_eq!(storage.as_bytes(), &[4, 2]);
        drop(storage);
        assert_eq!(fs::read(&path).unwrap(), vec![4, 2]);
    }

    #[test]
    fn test_collision_gets_suffix() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(8));

        let first = EntryStorage::allocate_disk(root.path(), 0x55, 4, &budget).unwrap();
        let second = EntryStorage::allocate_disk(root.path(), 0x55, 4, &budget).unwrap();

        assert_eq!(
            second.location().unwrap(),
            layout::entry_path(root.path(), 0x55, 1)
        );
        assert_ne!(first.location(), second.location());
    }

    #[test]
    fn test_budget_exhausted() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(1));

        let _held = EntryStorage::allocate_disk(root.path(), 1, 4, &budget).unwrap();
        let result = EntryStorage::allocate_disk(root.path(), 2, 4, &budget);

        assert!(matches!(
            result,
            Err(CacheError::FdBudgetExhausted {
                in_use: 1,
                budget: 1
            })
        ));
    }

    #[test]
    fn test_unmap_and_remap() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(1));

        let mut storage = EntryStorage::allocate_disk(root.path(), 3, 4, &budget).unwrap();
        storage.write(0, &[1, 2, 3, 4]).unwrap();

        assert!(storage.unmap());
        assert!(!storage.is_mapped());
        assert!(storage.as_bytes().is_empty());
        assert_eq!(budget.current_usage(), 0);

        storage.ensure_mapped(&budget).unwrap();
        assert_eq!(storage.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(budget.current_usage(), 1);
    }

    #[test]
    fn test_restored_storage_checks_size() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(4));
        let path = layout::entry_path(root.path(), 0x10, 0);
        fs::write(&path, [0u8; 3]).unwrap();

        let mut storage = EntryStorage::Disk(DiskStorage::restored(path, 8));
        let result = storage.ensure_mapped(&budget);

        assert!(matches!(result, Err(CacheError::Io(_))));
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_zero_length_disk_entry() {
        let root = disk_root();
        let budget = Arc::new(FdBudget::with_budget(4));

        let storage = EntryStorage::allocate_disk(root.path(), 0x20, 0, &budget).unwrap();

        assert!(storage.is_mapped());
        assert!(storage.as_bytes().is_empty());
        assert_eq!(budget.current_usage(), 0);
    }
}
