//! Table of contents persisted between sessions.
//!
//! At shutdown a disk-backed table writes one record per committed disk
//! entry to `<root>/restore.toc`; at the next startup the records are read
//! back and the entries reinserted without touching their payloads.
//!
//! # Format
//!
//! ```text
//! u32 LE   format version
//! bincode  Vec<TocRecord<K, P>>
//! ```
//!
//! A version mismatch or an undecodable body is not an error: the file is
//! discarded and the cache root wiped, so the next session starts cold.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::layout;
use super::types::CacheError;

/// File name of the table of contents under a cache root.
pub const TOC_FILE_NAME: &str = "restore.toc";

const TOC_TEMP_NAME: &str = "restore.toc.tmp";
const HEADER_LEN: usize = 4;

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocRecord<K, P> {
    pub key: K,
    pub params: P,
    /// Path of the payload file, relative to the cache root.
    pub location: PathBuf,
    pub size: u64,
}

/// Path of the table of contents under `root`.
pub fn toc_path(root: &Path) -> PathBuf {
    root.join(TOC_FILE_NAME)
}

/// Write `records` to `<root>/restore.toc`.
///
/// The file is written next to its final name and renamed into place, so a
/// crash mid-write never leaves a truncated table of contents.
pub fn save_toc<K, P>(root: &Path, version: u32, records: &[TocRecord<K, P>]) -> Result<(), CacheError>
where
    K: Serialize,
    P: Serialize,
{
    let body = bincode::serialize(records)?;
    let temp_path = root.join(TOC_TEMP_NAME);

    let written = write_toc_file(&temp_path, version, &body)
        .and_then(|()| fs::rename(&temp_path, toc_path(root)));
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    path = %temp_path.display(),
                    error = %cleanup,
                    "Failed to remove partial table of contents"
                );
            }
        }
        return Err(e.into());
    }

    tracing::info!(
        root = %root.display(),
        entries = records.len(),
        version = version,
        "Saved cache table of contents"
    );
    Ok(())
}

fn write_toc_file(path: &Path, version: u32, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&version.to_le_bytes())?;
    file.write_all(body)?;
    file.sync_all()
}

/// Read the table of contents under `root`.
///
/// Validates the shard layout first (wiping it if invalid). Records whose
/// file is missing or has the wrong size are dropped. The file is deleted
/// once read, so a crash before the next save never restores stale entries.
///
/// # Returns
///
/// The usable records, or an empty list when there was nothing to restore.
pub fn load_toc<K, P>(root: &Path, version: u32) -> Result<Vec<TocRecord<K, P>>, CacheError>
where
    K: DeserializeOwned,
    P: DeserializeOwned,
{
    if layout::ensure_structure(root)? {
        return Ok(Vec::new());
    }

    let path = toc_path(root);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(root = %root.display(), "No table of contents to restore");
            return Ok(Vec::new());
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read table of contents");
            layout::wipe_and_create(root)?;
            return Ok(Vec::new());
        }
    };

    if bytes.len() < HEADER_LEN {
        tracing::warn!(path = %path.display(), "Table of contents truncated, discarding");
        layout::wipe_and_create(root)?;
        return Ok(Vec::new());
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let found = u32::from_le_bytes(header);
    if found != version {
        tracing::info!(
            root = %root.display(),
            found = found,
            expected = version,
            "Cache format version changed, discarding cache"
        );
        layout::wipe_and_create(root)?;
        return Ok(Vec::new());
    }

    let records: Vec<TocRecord<K, P>> = match bincode::deserialize(&bytes[HEADER_LEN..]) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Table of contents unreadable, discarding");
            layout::wipe_and_create(root)?;
            return Ok(Vec::new());
        }
    };

    if let Err(e) = fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to delete table of contents");
    }

    let total = records.len();
    let usable: Vec<_> = records
        .into_iter()
        .filter(|record| record_is_usable(root, record))
        .collect();

    tracing::info!(
        root = %root.display(),
        restored = usable.len(),
        skipped = total - usable.len(),
        "Loaded cache table of contents"
    );
    Ok(usable)
}

/// Whether a record points at an entry file of the recorded size.
fn record_is_usable<K, P>(root: &Path, record: &TocRecord<K, P>) -> bool {
    let stays_under_root = record
        .location
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !stays_under_root {
        tracing::warn!(location = %record.location.display(), "Skipping entry outside cache root");
        return false;
    }

    let path = root.join(&record.location);
    match fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() && metadata.len() == record.size => true,
        Ok(metadata) => {
            tracing::debug!(
                path = %path.display(),
                expected = record.size,
                actual = metadata.len(),
                "Skipping entry with mismatched size"
            );
            false
        }
        Err(_) => {
            tracing::debug!(path = %path.display(), "Skipping entry with missing file");
            false
        }
    }
}

/// Delete entry files under `root` that no restored entry references.
///
/// # Returns
///
/// The number of files removed.
pub fn sweep_unreferenced(root: &Path, referenced: &HashSet<PathBuf>) -> usize {
    let mut removed = 0;
    for path in layout::list_entry_files(root) {
        if referenced.contains(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove orphaned file");
            }
        }
    }

    if removed > 0 {
        tracing::info!(root = %root.display(), removed = removed, "Removed orphaned cache files");
    }
    removed
}
