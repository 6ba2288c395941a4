//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file.
//! These are pure data types with no parsing or serialization logic.

use std::path::PathBuf;

/// Complete configuration loaded from config.ini.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Cache settings
    pub cache: CacheSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Cache configuration.
///
/// # Example
///
/// ```
/// use framecache::config::CacheSettings;
///
/// let settings = CacheSettings::default()
///     .with_directory("/tmp/framecache-doc")
///     .with_memory_size(512 * 1024 * 1024)
///     .with_max_open_files(Some(256));
///
/// assert_eq!(settings.memory_size, 512 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Root directory; each disk-backed cache gets a subdirectory
    pub directory: PathBuf,
    /// Node image cache size in bytes (memory)
    pub memory_size: u64,
    /// Disk image cache size in bytes
    pub disk_size: u64,
    /// Viewer frame cache size in bytes
    pub viewer_size: u64,
    /// Viewer frames of at least this many bytes are stored on disk
    pub viewer_memory_threshold: u64,
    /// Upper bound on concurrently mapped cache files
    pub max_open_files: Option<u64>,
    /// Share of system RAM, in percent, that memory pressure relief keeps free
    pub keep_free_ram_percent: u8,
    /// Viewer share of cache memory, in percent of the node cache, past which
    /// memory pressure relief evicts viewer frames first
    pub viewer_memory_percent: u8,
    /// On-disk format version; not read from the config file
    pub format_version: u32,
}

impl CacheSettings {
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = bytes;
        self
    }

    pub fn with_disk_size(mut self, bytes: u64) -> Self {
        self.disk_size = bytes;
        self
    }

    pub fn with_viewer_size(mut self, bytes: u64) -> Self {
        self.viewer_size = bytes;
        self
    }

    pub fn with_viewer_memory_threshold(mut self, bytes: u64) -> Self {
        self.viewer_memory_threshold = bytes;
        self
    }

    pub fn with_max_open_files(mut self, max_open_files: Option<u64>) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    pub fn with_keep_free_ram_percent(mut self, percent: u8) -> Self {
        self.keep_free_ram_percent = percent;
        self
    }

    pub fn with_viewer_memory_percent(mut self, percent: u8) -> Self {
        self.viewer_memory_percent = percent;
        self
    }

    pub fn with_format_version(mut self, version: u32) -> Self {
        self.format_version = version;
        self
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Log file path
    pub file: PathBuf,
}
