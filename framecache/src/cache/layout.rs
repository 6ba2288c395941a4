//! On-disk layout of a cache root.
//!
//! ```text
//! <root>/
//!   00/ 01/ ... ff/              256 shard directories
//!   <shard>/<14 hex digits>.cache
//!   <shard>/<14 hex digits>-<n>.cache   fingerprint collisions
//!   restore.toc                  table of contents (between sessions only)
//! ```
//!
//! The shard is the first byte of the key fingerprint and the file name the
//! remaining seven bytes, so an entry's file is found without scanning.
//! A root that does not hold exactly the 256 shards is never repaired: it is
//! wiped and rebuilt.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Number of shard directories under a cache root.
pub const SHARD_COUNT: usize = 256;

/// Extension of entry files.
pub const ENTRY_EXTENSION: &str = "cache";

/// Shard directory name for a fingerprint (`"00"`..`"ff"`).
pub fn shard_name(hash: u64) -> String {
    format!("{:02x}", hash >> 56)
}

/// Entry path relative to the cache root.
///
/// `collision` is 0 for the first entry with a given fingerprint; later
/// colliding entries get a numeric suffix.
///
/// # Example
///
/// ```
/// use std::path::PathBuf;
/// use framecache::cache::layout::relative_entry_path;
///
/// assert_eq!(
///     relative_entry_path(0xab01_2345_6789_cdef, 0),
///     PathBuf::from("ab/0123456789cdef.cache")
/// );
/// assert_eq!(
///     relative_entry_path(0xab01_2345_6789_cdef, 2),
///     PathBuf::from("ab/0123456789cdef-2.cache")
/// );
/// ```
pub fn relative_entry_path(hash: u64, collision: u32) -> PathBuf {
    let rest = hash & 0x00ff_ffff_ffff_ffff;
    let file_name = if collision == 0 {
        format!("{rest:014x}.{ENTRY_EXTENSION}")
    } else {
        format!("{rest:014x}-{collision}.{ENTRY_EXTENSION}")
    };
    PathBuf::from(shard_name(hash)).join(file_name)
}

/// Absolute entry path under `root`.
pub fn entry_path(root: &Path, hash: u64, collision: u32) -> PathBuf {
    root.join(relative_entry_path(hash, collision))
}

/// Count the immediate subdirectories of `root`.
pub fn count_subdirectories(root: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(root)? {
        if entry?.file_type()?.is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

/// Whether `root` holds exactly the 256 shard directories.
pub fn is_valid_structure(root: &Path) -> bool {
    match count_subdirectories(root) {
        Ok(count) if count == SHARD_COUNT => {
            (0..SHARD_COUNT).all(|shard| root.join(format!("{shard:02x}")).is_dir())
        }
        _ => false,
    }
}

/// Create the root and any missing shard directories.
pub fn create_structure(root: &Path) -> io::Result<()> {
    fs::create_dir_all(root)?;
    for shard in 0..SHARD_COUNT {
        let dir = root.join(format!("{shard:02x}"));
        if !dir.is_dir() {
            fs::create_dir(&dir)?;
        }
    }
    Ok(())
}

/// Delete everything under `root` and recreate the shard directories.
pub fn wipe_and_create(root: &Path) -> io::Result<()> {
    if root.exists() {
        fs::remove_dir_all(root)?;
    }
    create_structure(root)?;

    tracing::info!(root = %root.display(), "Cache directory structure reset");
    Ok(())
}

/// Validate the structure under `root`, resetting it when invalid.
///
/// Returns `true` if the structure had to be reset.
pub fn ensure_structure(root: &Path) -> io::Result<bool> {
    if is_valid_structure(root) {
        return Ok(false);
    }

    tracing::warn!(
        root = %root.display(),
        "Cache directory structure missing or invalid, wiping"
    );
    wipe_and_create(root)?;
    Ok(true)
}

/// Collect every entry file under the shard directories.
pub fn list_entry_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for shard in 0..SHARD_COUNT {
        let dir = root.join(format!("{shard:02x}"));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "Failed to read shard");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
    }
    files
}
