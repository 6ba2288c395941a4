//! Cache service lifecycle management.
//!
//! `CacheService` owns the application's three cache tables and the
//! descriptor budget they share:
//!
//! | Table         | Key        | Backing                              |
//! |---------------|------------|--------------------------------------|
//! | `NodeCache`   | `ImageKey` | memory                               |
//! | `DiskCache`   | `ImageKey` | disk, `<directory>/DiskCache`        |
//! | `ViewerCache` | `FrameKey` | disk above a size threshold, memory below |
//!
//! The service is created explicitly at startup and passed to whatever needs
//! it; nothing here is process-global apart from the descriptor limit.
//!
//! # Memory pressure
//!
//! [`CacheService::relieve_memory_pressure`] evicts in-memory entries while
//! free system RAM sits at or below the configured reserve. Viewer frames go
//! first while they outweigh their share of the node cache, node images
//! otherwise.
//!
//! # Usage
//!
//! ```no_run
//! use framecache::cache::CacheService;
//! use framecache::config::ConfigFile;
//!
//! let config = ConfigFile::load()?;
//! let service = CacheService::start(&config.cache)?;
//!
//! // ... evaluate the graph, reading and filling service.node_cache() ...
//!
//! service.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use super::fd_budget::{FdBudget, SharedFdBudget};
use super::key::{FrameKey, HolderId, ImageKey};
use super::layout;
use super::params::{FrameParams, ImageParams};
use super::stats::HolderUsage;
use super::table::CacheTable;
use super::types::{CacheError, StoragePolicy, TableConfig};
use crate::config::CacheSettings;
use crate::system;

/// Name of the in-memory node image table.
pub const NODE_CACHE_NAME: &str = "NodeCache";
/// Name of the disk image table, also its directory name.
pub const DISK_CACHE_NAME: &str = "DiskCache";
/// Name of the viewer frame table, also its directory name.
pub const VIEWER_CACHE_NAME: &str = "ViewerCache";

/// Fill ratio of the node cache from which it reports almost full.
pub const ALMOST_FULL_RATIO: f64 = 0.9;

/// The running set of cache tables.
pub struct CacheService {
    node_cache: CacheTable<ImageKey, ImageParams>,
    disk_cache: CacheTable<ImageKey, ImageParams>,
    viewer_cache: CacheTable<FrameKey, FrameParams>,
    fd_budget: SharedFdBudget,
    keep_free_ram_percent: u8,
    viewer_memory_percent: u8,
}

impl CacheService {
    /// Start the service, restoring the disk-backed tables.
    ///
    /// Raises the open-file soft limit and sizes the shared descriptor
    /// budget before any table maps a file.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache directory cannot be created or reset.
    pub fn start(settings: &CacheSettings) -> Result<Self, CacheError> {
        let fd_budget = Arc::new(FdBudget::for_cache(settings.max_open_files));
        Self::start_with_budget(settings, fd_budget)
    }

    /// Start the service with an existing descriptor budget.
    pub fn start_with_budget(
        settings: &CacheSettings,
        fd_budget: SharedFdBudget,
    ) -> Result<Self, CacheError> {
        let node_cache = CacheTable::open(
            TableConfig::memory(NODE_CACHE_NAME, settings.memory_size)
                .with_version(settings.format_version),
            Arc::clone(&fd_budget),
        )?;

        let disk_cache = CacheTable::open(
            TableConfig::disk(DISK_CACHE_NAME, settings.disk_size, disk_cache_root(settings))
                .with_version(settings.format_version),
            Arc::clone(&fd_budget),
        )?;

        let viewer_cache = CacheTable::open(
            TableConfig::disk(VIEWER_CACHE_NAME, settings.viewer_size, viewer_cache_root(settings))
                .with_policy(StoragePolicy::Threshold(settings.viewer_memory_threshold))
                .with_version(settings.format_version),
            Arc::clone(&fd_budget),
        )?;

        info!(
            directory = %settings.directory.display(),
            memory_bytes = settings.memory_size,
            disk_bytes = settings.disk_size,
            viewer_bytes = settings.viewer_size,
            fd_budget = fd_budget.budget(),
            restored_disk = disk_cache.len(),
            restored_viewer = viewer_cache.len(),
            "Cache service started"
        );

        Ok(Self {
            node_cache,
            disk_cache,
            viewer_cache,
            fd_budget,
            keep_free_ram_percent: settings.keep_free_ram_percent,
            viewer_memory_percent: settings.viewer_memory_percent,
        })
    }

    /// In-memory cache of node outputs.
    pub fn node_cache(&self) -> &CacheTable<ImageKey, ImageParams> {
        &self.node_cache
    }

    /// Disk cache of node outputs the user asked to keep.
    pub fn disk_cache(&self) -> &CacheTable<ImageKey, ImageParams> {
        &self.disk_cache
    }

    /// Cache of viewer textures.
    pub fn viewer_cache(&self) -> &CacheTable<FrameKey, FrameParams> {
        &self.viewer_cache
    }

    pub fn fd_budget(&self) -> &SharedFdBudget {
        &self.fd_budget
    }

    /// Drop every entry `holder` produced, in all tables.
    pub fn remove_all_for_holder(&self, holder: HolderId) -> usize {
        self.node_cache.remove_holder(holder)
            + self.disk_cache.remove_holder(holder)
            + self.viewer_cache.remove_holder(holder)
    }

    /// Drop the entries of `holder` computed from a node state other than
    /// `node_hash`, in all tables.
    pub fn remove_stale_for_holder(&self, holder: HolderId, node_hash: u64) -> usize {
        self.node_cache.remove_holder_except(holder, node_hash)
            + self.disk_cache.remove_holder_except(holder, node_hash)
            + self.viewer_cache.remove_holder_except(holder, node_hash)
    }

    /// Memory and disk occupancy of `holder` across all tables.
    pub fn memory_stats_for_holder(&self, holder: HolderId) -> HolderUsage {
        let mut usage = self.node_cache.memory_stats_for_holder(holder);
        usage += self.disk_cache.memory_stats_for_holder(holder);
        usage += self.viewer_cache.memory_stats_for_holder(holder);
        usage
    }

    /// Heap bytes held by all tables.
    pub fn total_memory_bytes(&self) -> u64 {
        self.node_cache.memory_bytes()
            + self.disk_cache.memory_bytes()
            + self.viewer_cache.memory_bytes()
    }

    /// Whether the node cache holds at least [`ALMOST_FULL_RATIO`] of its
    /// budget. A zero budget is always full.
    pub fn is_node_cache_almost_full(&self) -> bool {
        let max_bytes = self.node_cache.max_bytes();
        if max_bytes == 0 {
            return true;
        }
        self.node_cache.memory_bytes() as f64 / max_bytes as f64 >= ALMOST_FULL_RATIO
    }

    /// Size the node cache to `percent` of total system RAM.
    ///
    /// # Returns
    ///
    /// The number of entries evicted to fit the new budget.
    pub fn set_memory_percent(&self, percent: u8) -> usize {
        let max_bytes = system::percent_of(system::detect_total_memory(), percent);
        self.node_cache.set_max_bytes(max_bytes)
    }

    /// Evict in-memory entries while free RAM is at or below the reserve
    /// configured by `keep_free_ram_percent`.
    ///
    /// Does nothing on platforms that do not report available memory.
    ///
    /// # Returns
    ///
    /// The number of entries evicted.
    pub fn relieve_memory_pressure(&self) -> usize {
        if system::detect_available_memory().is_none() {
            return 0;
        }
        let keep_free = system::percent_of(system::detect_total_memory(), self.keep_free_ram_percent);
        self.relieve_memory_pressure_with(keep_free, || {
            system::detect_available_memory().unwrap_or(u64::MAX)
        })
    }

    /// Evict in-memory entries until `free_ram()` reports more than
    /// `keep_free` bytes, or nothing evictable is left.
    ///
    /// Viewer frames are evicted first while their memory exceeds
    /// `viewer_memory_percent` of the node cache's, node images otherwise.
    /// When the preferred table has nothing unlocked in memory the other one
    /// is tried.
    pub fn relieve_memory_pressure_with<F>(&self, keep_free: u64, mut free_ram: F) -> usize
    where
        F: FnMut() -> u64,
    {
        let viewer_share = f64::from(self.viewer_memory_percent) / 100.0;
        let mut evicted = 0;

        while free_ram() <= keep_free {
            let node_bytes = self.node_cache.memory_bytes();
            let viewer_bytes = self.viewer_cache.memory_bytes();
            let viewer_first = node_bytes == 0 || viewer_bytes as f64 / node_bytes as f64 > viewer_share;

            let freed = if viewer_first {
                self.viewer_cache.evict_lru_in_memory() || self.node_cache.evict_lru_in_memory()
            } else {
                self.node_cache.evict_lru_in_memory() || self.viewer_cache.evict_lru_in_memory()
            };
            if !freed {
                tracing::warn!(
                    keep_free = keep_free,
                    evicted = evicted,
                    "Free memory below reserve, nothing left to evict"
                );
                break;
            }
            evicted += 1;
        }

        if evicted > 0 {
            info!(evicted = evicted, "Evicted cached entries under memory pressure");
        }
        evicted
    }

    /// Empty every table.
    pub fn clear_all(&self) -> usize {
        self.node_cache.clear() + self.disk_cache.clear() + self.viewer_cache.clear()
    }

    /// Empty the disk-backed tables and reset their directories.
    ///
    /// Files still referenced by outstanding handles are removed from disk
    /// as well; the handles keep reading through their mapping.
    pub fn wipe_disk_caches(&self) -> Result<(), CacheError> {
        for (table, root) in [
            (self.disk_cache.name(), self.disk_cache.config().root.as_ref()),
            (self.viewer_cache.name(), self.viewer_cache.config().root.as_ref()),
        ] {
            let Some(root) = root else {
                continue;
            };
            info!(table = %table, root = %root.display(), "Wiping disk cache");
            layout::wipe_and_create(root)?;
        }
        self.disk_cache.clear();
        self.viewer_cache.clear();
        Ok(())
    }

    /// Write the tables of contents of the disk-backed tables.
    ///
    /// Saved tables are emptied; their files stay on disk for the next
    /// [`CacheService::start`].
    ///
    /// # Returns
    ///
    /// The number of entries saved.
    pub fn save(&self) -> Result<usize, CacheError> {
        let saved = self.disk_cache.save_toc()? + self.viewer_cache.save_toc()?;
        Ok(saved)
    }

    /// Stop the service.
    ///
    /// Cancels blocked lookups, then saves the disk-backed tables. A table
    /// that fails to save is logged and skipped; its files are swept at the
    /// next start.
    ///
    /// # Returns
    ///
    /// The number of entries saved.
    pub fn shutdown(self) -> usize {
        self.node_cache.shutdown();
        self.disk_cache.shutdown();
        self.viewer_cache.shutdown();

        let mut saved = 0;
        for result in [self.disk_cache.save_toc(), self.viewer_cache.save_toc()] {
            match result {
                Ok(count) => saved += count,
                Err(e) => tracing::warn!(error = %e, "Cache table not saved at shutdown"),
            }
        }

        info!(saved = saved, "Cache service stopped");
        saved
    }
}

fn disk_cache_root(settings: &CacheSettings) -> PathBuf {
    settings.directory.join(DISK_CACHE_NAME)
}

fn viewer_cache_root(settings: &CacheSettings) -> PathBuf {
    settings.directory.join(VIEWER_CACHE_NAME)
}
