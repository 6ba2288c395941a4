//! Configuration for the cache service.
//!
//! Settings are read from an INI file with a `[cache]` and a `[logging]`
//! section. Sizes are human-readable (`2GB`, `500MB`).
//!
//! # Example
//!
//! ```
//! use framecache::config::{parse_size, CacheSettings};
//!
//! let settings = CacheSettings::default()
//!     .with_memory_size(parse_size("512MB").unwrap())
//!     .with_disk_size(parse_size("10GB").unwrap());
//!
//! assert_eq!(settings.disk_size, 10 * 1024 * 1024 * 1024);
//! ```

mod defaults;
mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use defaults::{
    default_cache_dir, CACHE_FORMAT_VERSION, DEFAULT_DISK_CACHE_SIZE, DEFAULT_KEEP_FREE_RAM_PERCENT,
    DEFAULT_LOG_FILE, DEFAULT_MEMORY_CACHE_SIZE, DEFAULT_VIEWER_CACHE_SIZE,
    DEFAULT_VIEWER_MEMORY_PERCENT, DEFAULT_VIEWER_MEMORY_THRESHOLD,
};
pub use file::{config_directory, config_file_path, ConfigFileError};
pub use settings::{CacheSettings, ConfigFile, LoggingSettings};
pub use size::{format_size, parse_size, SizeParseError};
