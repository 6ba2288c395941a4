//! Core types shared by the cache tables.

use std::path::PathBuf;
use thiserror::Error;

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error while creating, mapping or removing entry storage
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No file descriptor left in the open-file budget
    #[error("Open file budget exhausted: {in_use} of {budget} descriptors in use")]
    FdBudgetExhausted { in_use: u64, budget: u64 },

    /// Release requested on an entry nobody holds
    #[error("Entry {entry_id} is not locked")]
    NotLocked { entry_id: u64 },

    /// The pending entry was removed from the table before the producer committed
    #[error("Claim on entry {entry_id} was revoked before commit")]
    ClaimRevoked { entry_id: u64 },

    /// The table was shut down while the caller was waiting on a pending entry
    #[error("Cache table '{0}' is shutting down")]
    ShuttingDown(String),

    /// Write past the end of an allocated storage block
    #[error("Payload of {required} bytes does not fit in {capacity} byte storage")]
    PayloadTooLarge { required: usize, capacity: usize },

    /// Table of contents could not be encoded or decoded
    #[error("Table of contents serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invalid cache configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Where a table places the payload of new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePolicy {
    /// Every entry lives in a heap buffer.
    MemoryOnly,
    /// Every entry is a memory-mapped file under the cache root.
    DiskOnly,
    /// Entries of at least this many bytes, or explicitly flagged, go to disk.
    Threshold(u64),
}

impl StoragePolicy {
    /// Whether this policy can produce disk-backed entries.
    pub fn uses_disk(self) -> bool {
        !matches!(self, StoragePolicy::MemoryOnly)
    }

    /// Decide the backing for an entry of `size` bytes.
    pub fn wants_disk(self, size: u64, prefer_disk: bool) -> bool {
        match self {
            StoragePolicy::MemoryOnly => false,
            StoragePolicy::DiskOnly => true,
            StoragePolicy::Threshold(threshold) => prefer_disk || size >= threshold,
        }
    }
}

/// Configuration for a single cache table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Table name, also used as the directory name under the cache root
    pub name: String,
    /// Capacity budget in bytes
    pub max_bytes: u64,
    /// Backing selection policy
    pub policy: StoragePolicy,
    /// Root directory holding the 256 shards (required for disk policies)
    pub root: Option<PathBuf>,
    /// Format version written to and expected from the table of contents
    pub version: u32,
}

impl TableConfig {
    /// Create an in-memory table configuration.
    pub fn memory(name: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            name: name.into(),
            max_bytes,
            policy: StoragePolicy::MemoryOnly,
            root: None,
            version: 1,
        }
    }

    /// Create a disk-backed table configuration rooted at `root`.
    pub fn disk(name: impl Into<String>, max_bytes: u64, root: PathBuf) -> Self {
        Self {
            name: name.into(),
            max_bytes,
            policy: StoragePolicy::DiskOnly,
            root: Some(root),
            version: 1,
        }
    }

    /// Set the storage policy.
    pub fn with_policy(mut self, policy: StoragePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the table of contents format version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Check that disk policies come with a root directory.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.policy.uses_disk() && self.root.is_none() {
            return Err(CacheError::InvalidConfig(format!(
                "table '{}' uses disk storage but has no root directory",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_memory_never_uses_disk() {
        let policy = StoragePolicy::MemoryOnly;
        assert!(!policy.uses_disk());
        assert!(!policy.wants_disk(u64::MAX, true));
    }

    #[test]
    fn test_policy_disk_always_uses_disk() {
        let policy = StoragePolicy::DiskOnly;
        assert!(policy.uses_disk());
        assert!(policy.wants_disk(0, false));
    }

    #[test]
    fn test_policy_threshold() {
        let policy = StoragePolicy::Threshold(1000);
        assert!(!policy.wants_disk(999, false));
        assert!(policy.wants_disk(1000, false));
        assert!(policy.wants_disk(10, true));
    }

    #[test]
    fn test_disk_config_without_root_is_invalid() {
        let config = TableConfig::memory("nodes", 100).with_policy(StoragePolicy::DiskOnly);
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_builders() {
        let config = TableConfig::disk("frames", 5000, PathBuf::from("/tmp/frames"))
            .with_policy(StoragePolicy::Threshold(64))
            .with_version(7);

        assert_eq!(config.name, "frames");
        assert_eq!(config.max_bytes, 5000);
        assert_eq!(config.policy, StoragePolicy::Threshold(64));
        assert_eq!(config.root, Some(PathBuf::from("/tmp/frames")));
        assert_eq!(config.version, 7);
        assert!(config.validate().is_ok());
    }
}
