//! INI serialization logic for converting `ConfigFile` → INI string.

use std::path::Path;

use super::settings::ConfigFile;
use super::size::format_size;

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let max_open_files = config
        .cache
        .max_open_files
        .map(|n| n.to_string())
        .unwrap_or_else(|| "auto".to_string());

    format!(
        r#"[cache]
; Root directory for disk-backed caches. Each cache uses its own subdirectory
; holding 256 shard directories and a restore.toc between sessions.
; If empty, defaults to ~/.cache/framecache (Linux) or platform cache directory
directory = {}
; Node image cache size (default: 2GB) - kept in RAM
; Supports: KB, MB, GB, TB suffixes (e.g., 500MB, 2GB)
memory_size = {}
; Disk image cache size (default: 20GB) - memory-mapped files, kept across sessions
disk_size = {}
; Viewer frame cache size (default: 4GB)
viewer_size = {}
; Viewer frames at least this large are stored on disk (default: 16MB)
viewer_memory_threshold = {}
; Maximum cache files mapped at once (default: auto, 90% of the open file limit)
max_open_files = {}
; Percentage of system RAM to keep free; cached images are evicted below it (default: 5)
keep_free_ram_percent = {}
; Viewer frame memory, as a percentage of node cache memory, above which
; viewer frames are evicted before node images (default: 50)
viewer_memory_percent = {}

[logging]
; Log file path
file = {}
"#,
        path_to_string(&config.cache.directory),
        format_size(config.cache.memory_size),
        format_size(config.cache.disk_size),
        format_size(config.cache.viewer_size),
        format_size(config.cache.viewer_memory_threshold),
        max_open_files,
        config.cache.keep_free_ram_percent,
        config.cache.viewer_memory_percent,
        path_to_string(&config.logging.file),
    )
}

fn path_to_string(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_sizes_are_human_readable() {
        let mut config = ConfigFile::default();
        config.cache.memory_size = 4 * 1024 * 1024 * 1024;
        config.cache.viewer_memory_threshold = 1000;

        let content = to_config_string(&config);

        assert!(content.contains("memory_size = 4GB\n"));
        assert!(content.contains("viewer_memory_threshold = 1000\n"));
        assert!(content.contains("max_open_files = auto\n"));
        assert!(content.contains("keep_free_ram_percent = 5\n"));
    }

    #[test]
    fn test_auto_open_files_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.logging.file = PathBuf::from("/tmp/framecache-test.log");
        config.save_to(&config_path).unwrap();

        let loaded = ConfigFile::load_from(&config_path).unwrap();

        assert_eq!(loaded.cache.max_open_files, None);
        assert_eq!(loaded.logging.file, PathBuf::from("/tmp/framecache-test.log"));
    }
}
