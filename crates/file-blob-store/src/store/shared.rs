//! Blob directory shared by every client as the canonical copy

use super::{
    discard_staged, exists, lock_blob, move_into_place, open_with_retry, purge_local,
    stage_source, touch_accessed, BlobHandle, CommitCallback,
};
use crate::error::{BlobStoreError, Result};
use crate::layout::BlobLayout;
use crate::remote::RemoteBlobStore;
use crate::staging::TransactionSlot;
use crate::types::BlobIdentity;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// The directory is the only copy: a missing file is a missing blob, and
/// staged files must reach their final names at vote time.
pub struct SharedBlobStore {
    layout: BlobLayout,
    keep_history: bool,
    txn: TransactionSlot,
}

impl SharedBlobStore {
    pub fn new(layout: BlobLayout, keep_history: bool) -> Self {
        Self {
            layout,
            keep_history,
            txn: TransactionSlot::default(),
        }
    }

    async fn load_locked(&self, id: BlobIdentity) -> Result<PathBuf> {
        let path = self.layout.path_for(&id);
        if exists(&path).await? {
            touch_accessed(&path).await;
            return Ok(path);
        }
        Err(BlobStoreError::not_found(id.object_id, id.revision_id))
    }
}

#[async_trait]
impl BlobHandle for SharedBlobStore {
    fn new_instance(&self, _remote: Arc<dyn RemoteBlobStore>) -> Box<dyn BlobHandle> {
        Box::new(SharedBlobStore::new(self.layout.clone(), self.keep_history))
    }

    fn temporary_directory(&self) -> Option<PathBuf> {
        Some(self.layout.temp_dir())
    }

    fn txn_has_blobs(&self) -> bool {
        self.txn.has_blobs()
    }

    fn begin(&mut self) -> Result<()> {
        self.txn.begin()
    }

    async fn store(
        &mut self,
        object_id: u64,
        source: &Path,
        commit: CommitCallback<'_>,
    ) -> Result<PathBuf> {
        self.txn.staging("store")?;
        let staged = stage_source(&self.layout, object_id, source).await?;
        if let Some(displaced) = self.txn.staging("store")?.stage(object_id, staged.clone()) {
            if let Err(e) = fs::remove_file(&displaced).await {
                warn!(object_id, path = %displaced.display(), error = %e, "Failed to remove replaced staged blob");
            }
        }
        commit()?;
        Ok(staged)
    }

    async fn load(&self, id: BlobIdentity) -> Result<PathBuf> {
        let path = self.layout.path_for(&id);
        if !exists(&path).await? {
            // Nothing to fetch; the shared directory is all there is.
            return Err(BlobStoreError::not_found(id.object_id, id.revision_id));
        }
        let _lock = lock_blob(&self.layout, &id).await?;
        self.load_locked(id).await
    }

    async fn open(&self, id: BlobIdentity) -> Result<fs::File> {
        open_with_retry(&self.layout, id, || self.load_locked(id)).await
    }

    async fn restore_blob(&self, id: BlobIdentity, source: &Path) -> Result<()> {
        let _lock = lock_blob(&self.layout, &id).await?;
        super::rename_or_copy(source, &self.layout.path_for(&id))
            .await
            .map_err(BlobStoreError::from_write)
    }

    async fn vote(&mut self, revision_id: u64) -> Result<()> {
        let entries = self.txn.vote(revision_id)?.entries();
        for (object_id, staged) in entries {
            let id = BlobIdentity::new(object_id, revision_id);
            let target = self.layout.path_for(&id);
            if staged == target {
                continue;
            }
            move_into_place(&self.layout, &staged, &id).await?;
            if let Some(area) = self.txn.area_mut() {
                area.relocate(object_id, target);
            }
        }
        Ok(())
    }

    async fn finish(&mut self, revision_id: u64) -> Result<()> {
        let area = self.txn.finish()?;
        if area.revision_id() != Some(revision_id) {
            warn!(
                voted = ?area.revision_id(),
                finished = revision_id,
                "Transaction finished under a different revision than it voted"
            );
        }
        debug!(blobs = area.len(), revision_id, "Finished blob transaction");
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(area) = self.txn.abort() {
            discard_staged(&self.layout, area.into_entries()).await;
        }
    }

    async fn after_purge(&self, id: BlobIdentity) -> Result<()> {
        purge_local(&self.layout, id, self.keep_history).await
    }

    async fn copy_forward(&mut self, copied: &[(u64, u64)], revision_id: u64) -> Result<()> {
        self.txn.staging("copy_forward")?;
        for &(object_id, old_revision) in copied {
            let original = self.layout.path_for(&BlobIdentity::new(object_id, old_revision));
            if !exists(&original).await? {
                // Not a blob.
                continue;
            }
            let id = BlobIdentity::new(object_id, revision_id);
            let target = self.layout.path_for(&id);
            {
                let _lock = lock_blob(&self.layout, &id).await?;
                fs::copy(&original, &target)
                    .await
                    .map_err(BlobStoreError::from_write)?;
            }
            if let Some(displaced) = self.txn.staging("copy_forward")?.stage(object_id, target) {
                let _ = fs::remove_file(&displaced).await;
            }
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use tempfile::{tempdir, TempDir};

    async fn shared_store(keep_history: bool) -> (TempDir, TempDir, SharedBlobStore) {
        let blobs = tempdir().unwrap();
        let work = tempdir().unwrap();
        let layout = BlobLayout::create(blobs.path()).await.unwrap();
        (blobs, work, SharedBlobStore::new(layout, keep_history))
    }

    async fn commit_blob(
        store: &mut SharedBlobStore,
        work: &TempDir,
        object_id: u64,
        revision_id: u64,
        data: &[u8],
    ) {
        let source = source_file(work.path(), &format!("{}-{}", object_id, revision_id), data).await;
        store.begin().unwrap();
        store.store(object_id, &source, no_commit()).await.unwrap();
        store.vote(revision_id).await.unwrap();
        store.finish(revision_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_vote_finish_then_load() {
        let (_blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"shared data").await;

        store.begin().unwrap();
        let staged = store.store(1000, &source, no_commit()).await.unwrap();
        assert!(staged.exists());
        assert!(!source.exists());
        assert!(store.txn_has_blobs());

        store.vote(0x10).await.unwrap();
        assert!(!staged.exists());
        store.finish(0x10).await.unwrap();
        assert!(!store.txn_has_blobs());

        let path = store.load(BlobIdentity::new(1000, 0x10)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"shared data");
    }

    #[tokio::test]
    async fn test_vote_places_file_before_finish() {
        let (_blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"early").await;

        store.begin().unwrap();
        store.store(7, &source, no_commit()).await.unwrap();
        store.vote(9).await.unwrap();

        // Visible to other readers as soon as the vote succeeds.
        let path = store.load(BlobIdentity::new(7, 9)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"early");
        store.finish(9).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_callback_runs_after_copy() {
        let (_blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"x").await;
        let mut called = false;

        store.begin().unwrap();
        let staged = store
            .store(
                3,
                &source,
                Box::new(|| {
                    called = true;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert!(called);
        assert!(staged.exists());
        store.abort().await;
    }

    #[tokio::test]
    async fn test_failed_commit_callback_leaves_abortable_state() {
        let (blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"x").await;

        store.begin().unwrap();
        let result = store
            .store(
                3,
                &source,
                Box::new(|| Err(BlobStoreError::protocol("row rejected"))),
            )
            .await;
        assert!(result.is_err());

        store.abort().await;
        assert!(files_with_suffix(&blobs, ".tmp").is_empty());
    }

    #[tokio::test]
    async fn test_last_store_wins() {
        let (blobs, work, mut store) = shared_store(true).await;
        let first = source_file(work.path(), "first", b"first").await;
        let second = source_file(work.path(), "second", b"second").await;

        store.begin().unwrap();
        let first_staged = store.store(5, &first, no_commit()).await.unwrap();
        store.store(5, &second, no_commit()).await.unwrap();
        assert!(!first_staged.exists());
        assert_eq!(files_with_suffix(&blobs, ".tmp").len(), 1);

        store.vote(2).await.unwrap();
        store.finish(2).await.unwrap();
        let path = store.load(BlobIdentity::new(5, 2)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let (blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"doomed").await;

        store.begin().unwrap();
        store.store(1000, &source, no_commit()).await.unwrap();
        store.vote(4).await.unwrap();
        store.abort().await;

        assert!(store.load(BlobIdentity::new(1000, 4)).await.unwrap_err().is_not_found());
        assert!(files_with_suffix(&blobs, ".tmp").is_empty());
        assert!(files_with_suffix(&blobs, ".blob").is_empty());
        assert!(!blobs.path().join("3").exists());

        // The handle is usable again.
        store.begin().unwrap();
    }

    #[tokio::test]
    async fn test_finish_twice_does_not_touch_files() {
        let (_blobs, work, mut store) = shared_store(true).await;
        commit_blob(&mut store, &work, 1, 1, b"once").await;

        assert!(matches!(store.finish(1).await, Err(BlobStoreError::Protocol(_))));
        let path = store.load(BlobIdentity::new(1, 1)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"once");
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let (_blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"x").await;

        assert!(matches!(
            store.store(1, &source, no_commit()).await,
            Err(BlobStoreError::Protocol(_))
        ));
        // Rejected before the source was touched.
        assert!(source.exists());

        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(BlobStoreError::Protocol(_))));
        assert!(matches!(store.finish(1).await, Err(BlobStoreError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_open_reads_committed_blob() {
        use tokio::io::AsyncReadExt;

        let (_blobs, work, mut store) = shared_store(true).await;
        commit_blob(&mut store, &work, 42, 3, b"stream me").await;

        let mut file = store.open(BlobIdentity::new(42, 3)).await.unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"stream me");

        assert!(store.open(BlobIdentity::new(42, 4)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_gives_up_when_file_vanishes() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (_blobs, work, mut store) = shared_store(true).await;
        commit_blob(&mut store, &work, 42, 3, b"gone").await;
        let id = BlobIdentity::new(42, 3);

        let calls = AtomicUsize::new(0);
        let (calls_ref, store_ref) = (&calls, &store);
        let result = open_with_retry(&store.layout, id, move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            let path = store_ref.load_locked(id).await?;
            // Removed between the existence check and the open.
            fs::remove_file(&path).await.unwrap();
            Ok(path)
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_after_vote_removes_lock_markers() {
        let (blobs, work, mut store) = shared_store(true).await;
        let source = source_file(work.path(), "a", b"doomed").await;

        store.begin().unwrap();
        store.store(998, &source, no_commit()).await.unwrap();
        store.vote(2).await.unwrap();
        assert_eq!(files_with_suffix(&blobs, ".lock").len(), 1);

        store.abort().await;
        assert!(files_with_suffix(&blobs, ".lock").is_empty());
        assert!(!blobs.path().join("1").exists());
    }

    #[tokio::test]
    async fn test_restore_blob_writes_final_location() {
        let (_blobs, work, store) = shared_store(true).await;
        let source = source_file(work.path(), "backup", b"restored").await;

        store.restore_blob(BlobIdentity::new(8, 8), &source).await.unwrap();
        let path = store.load(BlobIdentity::new(8, 8)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"restored");
    }

    #[tokio::test]
    async fn test_copy_forward_stages_final_names() {
        let (_blobs, work, mut store) = shared_store(true).await;
        commit_blob(&mut store, &work, 11, 1, b"version one").await;

        store.begin().unwrap();
        store.copy_forward(&[(11, 1), (12, 1)], 5).await.unwrap();
        assert!(store.txn_has_blobs());
        store.vote(5).await.unwrap();
        store.finish(5).await.unwrap();

        let path = store.load(BlobIdentity::new(11, 5)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"version one");
        // The old revision stays.
        assert!(store.load(BlobIdentity::new(11, 1)).await.is_ok());
        // 12 never had a blob.
        assert!(store.load(BlobIdentity::new(12, 5)).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_forward_undone_by_abort() {
        let (_blobs, work, mut store) = shared_store(true).await;
        commit_blob(&mut store, &work, 11, 1, b"version one").await;

        store.begin().unwrap();
        store.copy_forward(&[(11, 1)], 5).await.unwrap();
        store.abort().await;

        assert!(store.load(BlobIdentity::new(11, 5)).await.is_err());
        assert!(store.load(BlobIdentity::new(11, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_after_purge_keeps_other_revisions() {
        let (_blobs, work, mut store) = shared_store(true).await;
        commit_blob(&mut store, &work, 6, 1, b"one").await;
        commit_blob(&mut store, &work, 6, 2, b"two").await;
        commit_blob(&mut store, &work, 6 + 997, 1, b"neighbour").await;

        store.after_purge(BlobIdentity::new(6, 1)).await.unwrap();

        assert!(store.load(BlobIdentity::new(6, 1)).await.is_err());
        assert!(store.load(BlobIdentity::new(6, 2)).await.is_ok());
        assert!(store.load(BlobIdentity::new(6 + 997, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_after_purge_history_free_removes_all_revisions() {
        let (blobs, work, mut store) = shared_store(false).await;
        commit_blob(&mut store, &work, 6, 1, b"one").await;
        commit_blob(&mut store, &work, 6, 2, b"two").await;
        commit_blob(&mut store, &work, 6 + 997, 1, b"neighbour").await;

        store.after_purge(BlobIdentity::new(6, 1)).await.unwrap();

        assert!(store.load(BlobIdentity::new(6, 1)).await.is_err());
        assert!(store.load(BlobIdentity::new(6, 2)).await.is_err());
        assert!(store.load(BlobIdentity::new(6 + 997, 1)).await.is_ok());

        store.after_purge(BlobIdentity::new(6 + 997, 1)).await.unwrap();
        assert!(!blobs.path().join("6").exists());
    }
}
