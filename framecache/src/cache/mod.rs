//! Image and frame cache for node graph evaluation.
//!
//! Entries are keyed by a 64-bit fingerprint of the inputs that produced
//! them, held either in memory or in memory-mapped files under a 256-shard
//! directory, and evicted least recently used first once a table exceeds its
//! byte budget. Entries locked by a reader are never evicted.
//!
//! Disk-backed tables persist a table of contents at shutdown so the next
//! session can reuse their files.

mod entry;
mod fd_budget;
mod key;
pub mod layout;
mod lru;
mod params;
mod service;
mod stats;
mod storage;
mod table;
mod toc;
mod types;

pub use entry::{CacheEntry, EntryHandle, EntryId, EntryPhase};
pub use fd_budget::{
    raise_fd_soft_limit, FdBudget, FdReservation, SharedFdBudget, DEFAULT_FD_BUDGET_PERCENT,
    MIN_FD_BUDGET,
};
pub use key::{CacheKey, FrameKey, Hash64, HashField, HolderId, ImageKey};
pub use lru::LruLedger;
pub use params::{BitDepth, ChannelLayout, EntryParams, FrameParams, ImageParams, RectI};
pub use service::{
    CacheService, ALMOST_FULL_RATIO, DISK_CACHE_NAME, NODE_CACHE_NAME, VIEWER_CACHE_NAME,
};
pub use stats::{CacheStats, HolderUsage};
pub use storage::{DiskStorage, EntryStorage, MemoryStorage, MAX_COLLISIONS};
pub use table::{CacheTable, ClaimToken, Lookup};
pub use toc::{TocRecord, TOC_FILE_NAME};
pub use types::{CacheError, StoragePolicy, TableConfig};
