//! Reading and writing `config.ini`.
//!
//! A missing file is not an error: every setting has a default, and
//! [`ConfigFile::ensure_exists`] writes those defaults out so users have a
//! commented file to edit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use super::defaults::APP_DIR_NAME;
use super::parser::parse_ini;
use super::settings::ConfigFile;
use super::writer::to_config_string;

const CONFIG_FILE_NAME: &str = "config.ini";

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// The file exists but is not valid INI
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    #[error("Failed to write config file {}: {source}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// A key holds a value that cannot be interpreted
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to create config directory {}: {source}", path.display())]
    DirectoryError { path: PathBuf, source: io::Error },
}

impl ConfigFile {
    /// Load `config.ini` from [`config_directory`], or defaults if absent.
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        parse_ini(&Ini::load_from_file(path)?)
    }

    /// Write configuration to [`config_file_path`].
    pub fn save(&self) -> Result<(), ConfigFileError> {
        self.save_to(&config_file_path())
    }

    /// Write configuration to `path`, creating its directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| ConfigFileError::DirectoryError {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, to_config_string(self)).map_err(|source| ConfigFileError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the default configuration unless a config file already exists.
    ///
    /// Returns the config file path either way.
    pub fn ensure_exists() -> Result<PathBuf, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            Self::default().save_to(&path)?;
            tracing::info!(path = %path.display(), "Wrote default config file");
        }
        Ok(path)
    }
}

/// Per-user config directory (`~/.config/framecache` on Linux).
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn config_file_path() -> PathBuf {
    config_directory().join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();

        assert_eq!(config.cache.memory_size, DEFAULT_MEMORY_CACHE_SIZE);
        assert_eq!(config.cache.disk_size, DEFAULT_DISK_CACHE_SIZE);
        assert_eq!(config.cache.viewer_size, DEFAULT_VIEWER_CACHE_SIZE);
        assert!(config.cache.max_open_files.is_none());
        assert!(config.cache.directory.ends_with(APP_DIR_NAME));
        assert!(config.logging.file.ends_with(DEFAULT_LOG_FILE));
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();

        let config = ConfigFile::load_from(&temp_dir.path().join("nonexistent.ini")).unwrap();

        assert_eq!(config.cache, ConfigFile::default().cache);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = ConfigFile::default();
        config.cache = config
            .cache
            .with_directory(temp_dir.path().join("cache"))
            .with_memory_size(512 * 1024 * 1024)
            .with_max_open_files(Some(256));

        config.save_to(&path).unwrap();
        let loaded = ConfigFile::load_from(&path).unwrap();

        assert_eq!(loaded.cache, config.cache);
        assert_eq!(loaded.logging.file, config.logging.file);
    }

    #[test]
    fn test_malformed_file_is_read_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[cache\nmemory_size = 1GB\n").unwrap();

        let result = ConfigFile::load_from(&path);

        assert!(matches!(result, Err(ConfigFileError::ReadError(_))));
    }

    #[test]
    fn test_save_into_file_path_is_directory_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let result = ConfigFile::default().save_to(&blocker.join(CONFIG_FILE_NAME));

        assert!(matches!(result, Err(ConfigFileError::DirectoryError { .. })));
    }
}
