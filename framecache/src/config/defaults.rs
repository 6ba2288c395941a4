//! Default values and constants for all configuration settings.
//!
//! Contains all `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use std::path::PathBuf;

use super::settings::*;

// =============================================================================
// Cache defaults
// =============================================================================

/// Default node image cache size (2GB).
pub const DEFAULT_MEMORY_CACHE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Default disk image cache size (20GB).
pub const DEFAULT_DISK_CACHE_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Default viewer frame cache size (4GB).
pub const DEFAULT_VIEWER_CACHE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default size at which viewer frames are stored on disk instead of in
/// memory (16MB).
pub const DEFAULT_VIEWER_MEMORY_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Default share of system RAM kept free under memory pressure (5%).
pub const DEFAULT_KEEP_FREE_RAM_PERCENT: u8 = 5;

/// Default viewer share of cache memory relative to the node cache (50%).
pub const DEFAULT_VIEWER_MEMORY_PERCENT: u8 = 50;

/// Format version of the on-disk cache. Bump it whenever keys, params or the
/// table of contents change shape; older caches are then discarded.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Directory name used under the platform cache and config directories.
pub const APP_DIR_NAME: &str = "framecache";

/// Default log file name.
pub const DEFAULT_LOG_FILE: &str = "framecache.log";

/// Default cache root (`~/.cache/framecache` on Linux).
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

// =============================================================================
// ConfigFile::default()
// =============================================================================

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
            memory_size: DEFAULT_MEMORY_CACHE_SIZE,
            disk_size: DEFAULT_DISK_CACHE_SIZE,
            viewer_size: DEFAULT_VIEWER_CACHE_SIZE,
            viewer_memory_threshold: DEFAULT_VIEWER_MEMORY_THRESHOLD,
            max_open_files: None,
            keep_free_ram_percent: DEFAULT_KEEP_FREE_RAM_PERCENT,
            viewer_memory_percent: DEFAULT_VIEWER_MEMORY_PERCENT,
            format_version: CACHE_FORMAT_VERSION,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        let config_dir = super::file::config_directory();

        Self {
            cache: CacheSettings::default(),
            logging: LoggingSettings {
                file: config_dir.join(DEFAULT_LOG_FILE),
            },
        }
    }
}
