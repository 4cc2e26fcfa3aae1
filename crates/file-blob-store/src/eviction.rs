//! Least-recently-used eviction over a cache directory
//!
//! One pass walks the shard directories, sums blob sizes and groups the
//! files by access time, then deletes oldest groups first until the
//! directory fits the target. Files whose per-blob lock is held are in use
//! and are skipped. Passes are serialised across processes by the
//! directory's scan lock.

use crate::error::Result;
use crate::layout::{is_shard_name, BlobLayout, BLOB_SUFFIX};
use crate::lock::FileLock;
use crate::types::{DirectoryStats, EvictionReport};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Wait before the single retry for a busy scan lock
pub const SCAN_LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct ScannedBlob {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Transient view of the directory built by one walk
#[derive(Debug, Default)]
struct Snapshot {
    files: usize,
    total_size: u64,
    // Ties keep discovery order inside a group.
    by_access_time: BTreeMap<SystemTime, Vec<ScannedBlob>>,
}

pub struct EvictionScanner {
    layout: BlobLayout,
    target_size: u64,
}

impl EvictionScanner {
    pub fn new(layout: BlobLayout, target_size: u64) -> Self {
        Self {
            layout,
            target_size,
        }
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    /// Run one pass. Blocks; call from a blocking worker.
    pub fn run(&self) -> Result<EvictionReport> {
        let scan_lock_path = self.layout.scan_lock_path();
        let _scan_lock = match FileLock::try_acquire(&scan_lock_path)? {
            Some(lock) => lock,
            None => {
                std::thread::sleep(SCAN_LOCK_RETRY_DELAY);
                match FileLock::try_acquire(&scan_lock_path)? {
                    Some(lock) => lock,
                    None => {
                        debug!(root = %self.layout.root().display(), "Another scanner is shrinking the cache");
                        return Ok(EvictionReport::skipped(self.target_size));
                    }
                }
            }
        };

        let started_at = Utc::now();
        let snapshot = scan(&self.layout);
        let initial_size = snapshot.total_size;
        debug!(
            size = initial_size,
            target = self.target_size,
            files = snapshot.files,
            "Checked blob cache size"
        );

        let mut size = initial_size;
        let mut removed_files = 0;
        let mut skipped_locked = 0;

        'groups: for (_, group) in snapshot.by_access_time {
            if size <= self.target_size {
                break;
            }
            for blob in group {
                let lock = match FileLock::try_acquire(&blob.lock_path) {
                    Ok(Some(lock)) => lock,
                    Ok(None) => {
                        debug!(path = %blob.path.display(), "Skipping locked blob");
                        skipped_locked += 1;
                        continue;
                    }
                    Err(e) => {
                        debug!(path = %blob.path.display(), error = %e, "Could not lock blob for eviction");
                        continue;
                    }
                };

                let file_size = match fs::metadata(&blob.path) {
                    Ok(meta) => meta.len(),
                    Err(e) => {
                        debug!(path = %blob.path.display(), error = %e, "Blob vanished before eviction");
                        lock.remove();
                        continue;
                    }
                };
                match fs::remove_file(&blob.path) {
                    Ok(()) => {
                        size = size.saturating_sub(file_size);
                        removed_files += 1;
                        lock.remove();
                    }
                    Err(e) => {
                        debug!(path = %blob.path.display(), error = %e, "Could not evict blob");
                    }
                }

                if size <= self.target_size {
                    break 'groups;
                }
            }
        }

        info!(
            root = %self.layout.root().display(),
            initial_size,
            final_size = size,
            target = self.target_size,
            removed_files,
            skipped_locked,
            "Reduced blob cache size"
        );

        Ok(EvictionReport {
            started_at,
            target_size: self.target_size,
            initial_size,
            final_size: size,
            removed_files,
            skipped_locked,
            ran: true,
        })
    }
}

/// Count and size the blob files of a directory.
pub fn directory_stats(layout: &BlobLayout) -> DirectoryStats {
    let snapshot = scan(layout);
    DirectoryStats {
        files: snapshot.files,
        total_size: snapshot.total_size,
    }
}

fn scan(layout: &BlobLayout) -> Snapshot {
    let mut snapshot = Snapshot::default();

    let walker = WalkDir::new(layout.root())
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || (entry.file_type().is_dir()
                    && entry.file_name().to_str().is_some_and(is_shard_name))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Files come and go while we walk.
                debug!(error = %e, "Skipping unreadable cache entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(shard) = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        else {
            continue;
        };
        if !name.ends_with(BLOB_SUFFIX) {
            continue;
        }
        let Some(id) = BlobLayout::parse_blob_name(shard, name) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };

        let accessed = meta
            .accessed()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        snapshot.files += 1;
        snapshot.total_size += meta.len();
        snapshot
            .by_access_time
            .entry(accessed)
            .or_default()
            .push(ScannedBlob {
                path: entry.path().to_path_buf(),
                lock_path: layout.lock_path_for(&id),
            });
    }

    snapshot
}
