//! INI parsing logic for converting an `Ini` document into a `ConfigFile`.

use std::path::PathBuf;

use ini::{Ini, Properties};

use super::file::ConfigFileError;
use super::settings::ConfigFile;
use super::size::parse_size;

/// Parse an INI document into a `ConfigFile`, starting from defaults.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [cache] section
    if let Some(section) = ini.section(Some("cache")) {
        if let Some(v) = section.get("directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.cache.directory = expand_tilde(v);
            }
        }
        if let Some(v) = size_value(section, "memory_size", "2GB")? {
            config.cache.memory_size = v;
        }
        if let Some(v) = size_value(section, "disk_size", "20GB")? {
            config.cache.disk_size = v;
        }
        if let Some(v) = size_value(section, "viewer_size", "4GB")? {
            config.cache.viewer_size = v;
        }
        if let Some(v) = size_value(section, "viewer_memory_threshold", "16MB")? {
            config.cache.viewer_memory_threshold = v;
        }
        if let Some(v) = percent_value(section, "keep_free_ram_percent")? {
            config.cache.keep_free_ram_percent = v;
        }
        if let Some(v) = percent_value(section, "viewer_memory_percent")? {
            config.cache.viewer_memory_percent = v;
        }
        if let Some(v) = section.get("max_open_files") {
            let v = v.trim();
            config.cache.max_open_files = if v.is_empty() || v == "auto" {
                None
            } else {
                match v.parse::<u64>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => {
                        return Err(ConfigFileError::InvalidValue {
                            section: "cache".to_string(),
                            key: "max_open_files".to_string(),
                            value: v.to_string(),
                            reason: "must be a positive integer or 'auto'".to_string(),
                        })
                    }
                }
            };
        }
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.file = expand_tilde(v);
            }
        }
    }

    Ok(config)
}

/// Read a human-readable size from `[cache] key`.
fn size_value(section: &Properties, key: &str, example: &str) -> Result<Option<u64>, ConfigFileError> {
    let Some(v) = section.get(key) else {
        return Ok(None);
    };
    parse_size(v)
        .map(Some)
        .map_err(|_| ConfigFileError::InvalidValue {
            section: "cache".to_string(),
            key: key.to_string(),
            value: v.to_string(),
            reason: format!("expected format like '{example}', '500MB', or '1024KB'"),
        })
}

/// Read a whole percentage (0 to 100) from `[cache] key`.
fn percent_value(section: &Properties, key: &str) -> Result<Option<u8>, ConfigFileError> {
    let Some(v) = section.get(key) else {
        return Ok(None);
    };
    let trimmed = v.trim().trim_end_matches('%').trim_end();
    match trimmed.parse::<u8>() {
        Ok(percent) if percent <= 100 => Ok(Some(percent)),
        _ => Err(ConfigFileError::InvalidValue {
            section: "cache".to_string(),
            key: key.to_string(),
            value: v.to_string(),
            reason: "must be a whole percentage between 0 and 100".to_string(),
        }),
    }
}

/// Expand ~ to home directory in paths.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::*;
    use tempfile::TempDir;

    fn load(content: &str) -> Result<ConfigFile, ConfigFileError> {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.ini");
        std::fs::write(&config_path, content).unwrap();
        ConfigFile::load_from(&config_path)
    }

    #[test]
    fn test_invalid_cache_size() {
        let result = load(
            r#"
[cache]
memory_size = 2PB
"#,
        );

        let err = result.unwrap_err();
        assert!(err.to_string().contains("memory_size"));
    }

    #[test]
    fn test_human_readable_sizes() {
        let config = load(
            r#"
[cache]
memory_size = 4GB
disk_size = 50GB
viewer_size = 1GB
viewer_memory_threshold = 8MB
"#,
        )
        .unwrap();

        assert_eq!(config.cache.memory_size, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.cache.disk_size, 50 * 1024 * 1024 * 1024);
        assert_eq!(config.cache.viewer_size, 1024 * 1024 * 1024);
        assert_eq!(config.cache.viewer_memory_threshold, 8 * 1024 * 1024);
    }

    #[test]
    fn test_max_open_files() {
        let config = load("[cache]\nmax_open_files = 512\n").unwrap();
        assert_eq!(config.cache.max_open_files, Some(512));

        let config = load("[cache]\nmax_open_files = auto\n").unwrap();
        assert_eq!(config.cache.max_open_files, None);

        let err = load("[cache]\nmax_open_files = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_open_files"));
    }

    #[test]
    fn test_memory_percentages() {
        let config = load("[cache]\nkeep_free_ram_percent = 10%\nviewer_memory_percent = 25\n").unwrap();
        assert_eq!(config.cache.keep_free_ram_percent, 10);
        assert_eq!(config.cache.viewer_memory_percent, 25);

        let err = load("[cache]\nkeep_free_ram_percent = 150\n").unwrap_err();
        assert!(err.to_string().contains("keep_free_ram_percent"));
    }

    #[test]
    fn test_directory_and_log_file() {
        let config = load(
            r#"
[cache]
directory = /mnt/scratch/framecache

[logging]
file = /var/log/framecache.log
"#,
        )
        .unwrap();

        assert_eq!(config.cache.directory, PathBuf::from("/mnt/scratch/framecache"));
        assert_eq!(config.logging.file, PathBuf::from("/var/log/framecache.log"));
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/path");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, home.join("test/path"));
        }

        // Non-tilde paths should be unchanged
        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_partial_config() {
        let config = load("[cache]\ndisk_size = 1GB\n").unwrap();

        assert_eq!(config.cache.disk_size, 1024 * 1024 * 1024);
        assert_eq!(config.cache.memory_size, DEFAULT_MEMORY_CACHE_SIZE);
        assert_eq!(config.cache.format_version, CACHE_FORMAT_VERSION);
        assert_eq!(config.cache.keep_free_ram_percent, DEFAULT_KEEP_FREE_RAM_PERCENT);
    }
}
