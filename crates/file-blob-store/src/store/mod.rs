//! Blob store variants and the factory that picks one from options
//!
//! Every variant implements the same transactional contract; callers hold a
//! `Box<dyn BlobHandle>` and never need to know which one they got.

mod cache;
mod no_blob;
mod shared;

pub use cache::CacheBlobStore;
pub use no_blob::NoBlobStore;
pub use shared::SharedBlobStore;

use crate::budget::{Budget, CacheBudgetController};
use crate::config::BlobStoreOptions;
use crate::error::{BlobStoreError, Result};
use crate::layout::{object_prefix, BlobLayout, SHARD_COUNT, TEMP_SUFFIX};
use crate::lock::FileLock;
use crate::remote::RemoteBlobStore;
use crate::types::BlobIdentity;
use async_trait::async_trait;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

/// The caller's "record the row" step, run by `store` once the file is staged.
pub type CommitCallback<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// Transactional access to the blobs of one storage.
///
/// A handle runs at most one transaction at a time:
/// `begin`, any number of `store`/`copy_forward`, `vote`, `finish`, with
/// `abort` allowed anywhere before `finish`.
#[async_trait]
pub trait BlobHandle: Send + Sync {
    /// A fresh handle on the same directory and cache budget.
    fn new_instance(&self, remote: Arc<dyn RemoteBlobStore>) -> Box<dyn BlobHandle>;

    /// Scratch directory on the blob filesystem, if there is one.
    fn temporary_directory(&self) -> Option<PathBuf>;

    fn txn_has_blobs(&self) -> bool;

    fn begin(&mut self) -> Result<()>;

    /// Take over `source` for `object_id` in the open transaction, then run
    /// `commit`. Returns the staged path.
    async fn store(
        &mut self,
        object_id: u64,
        source: &Path,
        commit: CommitCallback<'_>,
    ) -> Result<PathBuf>;

    /// Path of a committed blob on local disk, fetching it if needed.
    async fn load(&self, id: BlobIdentity) -> Result<PathBuf>;

    async fn open(&self, id: BlobIdentity) -> Result<fs::File>;

    /// Put a committed blob in place outside any transaction.
    async fn restore_blob(&self, id: BlobIdentity, source: &Path) -> Result<()>;

    async fn vote(&mut self, revision_id: u64) -> Result<()>;

    async fn finish(&mut self, revision_id: u64) -> Result<()>;

    /// Drop the open transaction and its staged files. Never fails.
    async fn abort(&mut self);

    /// Forget local files of a revision the packer removed.
    async fn after_purge(&self, id: BlobIdentity) -> Result<()>;

    /// Copy blobs of `(object_id, old_revision)` pairs to `revision_id`
    /// after an undo.
    async fn copy_forward(&mut self, copied: &[(u64, u64)], revision_id: u64) -> Result<()>;

    /// Wait for background work on the directory to settle.
    async fn close(&self);
}

/// Build the handle variant selected by `options`.
pub async fn open_blob_store(
    options: &BlobStoreOptions,
    remote: Arc<dyn RemoteBlobStore>,
) -> Result<Box<dyn BlobHandle>> {
    options.validate()?;

    let Some(dir) = options.cache_directory.as_ref() else {
        info!("No blob directory configured, blobs are disabled");
        return Ok(Box::new(NoBlobStore::new()));
    };

    let layout = BlobLayout::create(dir).await?;

    if options.shared_directory {
        if options.max_cache_bytes.is_some() {
            warn!(
                dir = %dir.display(),
                "Ignoring blob cache size limit for a shared blob directory"
            );
        }
        info!(dir = %dir.display(), keep_history = options.keep_history, "Using shared blob directory");
        return Ok(Box::new(SharedBlobStore::new(layout, options.keep_history)));
    }

    let budget = options
        .max_cache_bytes
        .map(|max| Budget::new(max, options.check_percent))
        .transpose()?;
    info!(
        dir = %dir.display(),
        max_bytes = ?budget.map(|b| b.max_bytes),
        "Using blob cache directory"
    );
    let controller = Arc::new(CacheBudgetController::new(layout.clone(), budget)?);
    controller.check_now();

    Ok(Box::new(CacheBlobStore::new(
        layout,
        controller,
        remote,
        options.keep_history,
    )))
}

/// Per-blob lock. On release its marker is unlinked if the blob file is
/// gone, so markers only outlive the blobs that are locked right now.
pub(crate) struct BlobLock {
    lock: Option<FileLock>,
    blob: PathBuf,
}

impl Drop for BlobLock {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if self.blob.exists() {
                drop(lock);
            } else {
                lock.remove();
            }
        }
    }
}

/// Lock one blob, creating its shard directory first.
pub(crate) async fn lock_blob(layout: &BlobLayout, id: &BlobIdentity) -> Result<BlobLock> {
    layout.ensure_directory_for(id.object_id).await?;
    let lock = FileLock::acquire(&layout.lock_path_for(id)).await?;
    Ok(BlobLock {
        lock: Some(lock),
        blob: layout.path_for(id),
    })
}

/// Move `source` into a fresh temp file in the object's shard directory.
pub(crate) async fn stage_source(
    layout: &BlobLayout,
    object_id: u64,
    source: &Path,
) -> Result<PathBuf> {
    let mut attempt = 0;
    let temp = loop {
        let dir = layout
            .ensure_directory_for(object_id)
            .await
            .map_err(write_error)?;
        let created = tempfile::Builder::new()
            .prefix(&object_prefix(object_id))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&dir);
        match created {
            Ok(file) => break file,
            // An emptied shard can be removed between the two calls.
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt == 0 => attempt += 1,
            Err(e) => return Err(BlobStoreError::from_write(e)),
        }
    };
    let temp = temp
        .into_temp_path()
        .keep()
        .map_err(|e| BlobStoreError::from_write(e.error))?;

    if let Err(e) = rename_or_copy(source, &temp).await {
        let _ = fs::remove_file(&temp).await;
        return Err(BlobStoreError::from_write(e));
    }
    Ok(temp)
}

/// Move a staged file to the blob's final name under its lock, returning
/// its size.
pub(crate) async fn move_into_place(
    layout: &BlobLayout,
    source: &Path,
    id: &BlobIdentity,
) -> Result<u64> {
    let size = fs::metadata(source).await?.len();
    let _lock = lock_blob(layout, id).await?;
    rename_or_copy(source, &layout.path_for(id))
        .await
        .map_err(BlobStoreError::from_write)?;
    Ok(size)
}

/// Rename, falling back to copy-and-delete across filesystems.
pub(crate) async fn rename_or_copy(source: &Path, target: &Path) -> io::Result<()> {
    if fs::rename(source, target).await.is_ok() {
        return Ok(());
    }
    fs::copy(source, target).await?;
    fs::remove_file(source).await
}

/// Refresh a blob's access time so eviction sees it as recently used.
pub(crate) async fn touch_accessed(path: &Path) {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)?
            .set_times(std::fs::FileTimes::new().set_accessed(SystemTime::now()))
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!(error = %e, "Could not update blob access time");
    }
}

pub(crate) async fn exists(path: &Path) -> Result<bool> {
    Ok(fs::try_exists(path).await?)
}

pub(crate) fn download_temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Open a blob, retrying once under a fresh lock if it vanished between
/// the existence check and the open.
pub(crate) async fn open_with_retry<F, Fut>(
    layout: &BlobLayout,
    id: BlobIdentity,
    load_locked: F,
) -> Result<fs::File>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<PathBuf>>,
{
    for attempt in 0..2 {
        let _lock = lock_blob(layout, &id).await?;
        let path = load_locked().await?;
        match fs::File::open(&path).await {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(blob = %id, attempt, "Blob vanished before open");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(BlobStoreError::not_found(id.object_id, id.revision_id))
}

/// Delete staged files of an abandoned transaction, logging failures.
///
/// Entries already under a final blob name are removed under that blob's
/// lock.
pub(crate) async fn discard_staged(layout: &BlobLayout, entries: Vec<(u64, PathBuf)>) {
    for (object_id, path) in entries {
        let shard = (object_id % SHARD_COUNT).to_string();
        let final_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| BlobLayout::parse_blob_name(&shard, name));
        let guard = match final_id {
            Some(id) => match lock_blob(layout, &id).await {
                Ok(lock) => Some(lock),
                Err(e) => {
                    warn!(blob = %id, error = %e, "Could not lock staged blob, leaving it in place");
                    continue;
                }
            },
            None => None,
        };

        match fs::remove_file(&path).await {
            Ok(()) => debug!(object_id, path = %path.display(), "Discarded staged blob"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(object_id, path = %path.display(), error = %e, "Failed to discard staged blob")
            }
        }
        drop(guard);
        remove_shard_if_empty(&layout.shard_dir(object_id)).await;
    }
}

/// Remove local files of a purged revision, or of every revision of the
/// object when history is not kept.
pub(crate) async fn purge_local(
    layout: &BlobLayout,
    id: BlobIdentity,
    keep_history: bool,
) -> Result<()> {
    let shard = layout.shard_dir(id.object_id);
    if !exists(&shard).await? {
        return Ok(());
    }

    let doomed = if keep_history {
        vec![id]
    } else {
        let prefix = object_prefix(id.object_id);
        let shard_name = (id.object_id % SHARD_COUNT).to_string();
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&shard).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Some(found) = BlobLayout::parse_blob_name(&shard_name, name) {
                ids.push(found);
            }
        }
        ids
    };

    for doomed_id in doomed {
        let path = layout.path_for(&doomed_id);
        let _lock = lock_blob(layout, &doomed_id).await?;
        match fs::remove_file(&path).await {
            Ok(()) => debug!(blob = %doomed_id, "Removed purged blob"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    remove_shard_if_empty(&shard).await;
    Ok(())
}

/// Remove a shard directory if it is empty. A marker of a held lock keeps
/// the directory in place.
pub(crate) async fn remove_shard_if_empty(dir: &Path) {
    match fs::remove_dir(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed empty shard directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(dir = %dir.display(), error = %e, "Shard directory still in use"),
    }
}

fn write_error(err: BlobStoreError) -> BlobStoreError {
    match err {
        BlobStoreError::Io(e) => BlobStoreError::from_write(*e),
        other => other,
    }
}
