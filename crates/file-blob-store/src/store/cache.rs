//! Private, size-limited copy of blobs whose canonical bytes live remotely

use super::{
    discard_staged, download_temp_path, exists, lock_blob, move_into_place, open_with_retry,
    purge_local, stage_source, touch_accessed, BlobHandle, CommitCallback,
};
use crate::budget::CacheBudgetController;
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

pub struct CacheBlobStore {
    layout: BlobLayout,
    controller: Arc<CacheBudgetController>,
    remote: Arc<dyn RemoteBlobStore>,
    keep_history: bool,
    txn: TransactionSlot,
}

impl CacheBlobStore {
    pub fn new(
        layout: BlobLayout,
        controller: Arc<CacheBudgetController>,
        remote: Arc<dyn RemoteBlobStore>,
        keep_history: bool,
    ) -> Self {
        Self {
            layout,
            controller,
            remote,
            keep_history,
            txn: TransactionSlot::default(),
        }
    }

    pub fn controller(&self) -> &Arc<CacheBudgetController> {
        &self.controller
    }

    /// Return the local file, downloading it first if needed. The caller
    /// holds the blob's lock.
    async fn load_locked(&self, id: BlobIdentity) -> Result<PathBuf> {
        let path = self.layout.path_for(&id);
        if exists(&path).await? {
            touch_accessed(&path).await;
            return Ok(path);
        }

        let temp = download_temp_path(&path);
        let bytes = match self
            .remote
            .download_blob(id.object_id, id.revision_id, &temp)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                return Err(BlobStoreError::RemoteFetchFailed(format!("{}: {}", id, e)));
            }
        };

        if exists(&temp).await? {
            fs::rename(&temp, &path)
                .await
                .map_err(BlobStoreError::from_write)?;
            debug!(blob = %id, bytes, "Downloaded blob into cache");
            self.controller.report(bytes);
        }

        if exists(&path).await? {
            Ok(path)
        } else {
            Err(BlobStoreError::not_found(id.object_id, id.revision_id))
        }
    }
}

#[async_trait]
impl BlobHandle for CacheBlobStore {
    fn new_instance(&self, remote: Arc<dyn RemoteBlobStore>) -> Box<dyn BlobHandle> {
        Box::new(CacheBlobStore::new(
            self.layout.clone(),
            Arc::clone(&self.controller),
            remote,
            self.keep_history,
        ))
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

        self.remote
            .upload_blob(object_id, None, &staged)
            .await
            .map_err(|e| BlobStoreError::RemoteUploadFailed(format!("object {}: {}", object_id, e)))?;
        Ok(staged)
    }

    async fn load(&self, id: BlobIdentity) -> Result<PathBuf> {
        let path = self.layout.path_for(&id);
        if exists(&path).await? {
            touch_accessed(&path).await;
            return Ok(path);
        }
        let _lock = lock_blob(&self.layout, &id).await?;
        self.load_locked(id).await
    }

    async fn open(&self, id: BlobIdentity) -> Result<fs::File> {
        open_with_retry(&self.layout, id, || self.load_locked(id)).await
    }

    async fn restore_blob(&self, id: BlobIdentity, source: &Path) -> Result<()> {
        self.remote
            .upload_blob(id.object_id, Some(id.revision_id), source)
            .await
            .map_err(|e| BlobStoreError::RemoteUploadFailed(format!("{}: {}", id, e)))
    }

    async fn vote(&mut self, revision_id: u64) -> Result<()> {
        self.txn.vote(revision_id).map(|_| ())
    }

    async fn finish(&mut self, revision_id: u64) -> Result<()> {
        let area = self.txn.finish()?;
        let mut first_error = None;
        let mut loaded = 0u64;

        for (object_id, staged) in area.into_entries() {
            let id = BlobIdentity::new(object_id, revision_id);
            match move_into_place(&self.layout, &staged, &id).await {
                Ok(size) => loaded += size,
                Err(e) => {
                    warn!(blob = %id, error = %e, "Failed to move staged blob into the cache");
                    let _ = fs::remove_file(&staged).await;
                    first_error.get_or_insert(e);
                }
            }
        }

        self.controller.report(loaded);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn abort(&mut self) {
        if let Some(area) = self.txn.abort() {
            discard_staged(&self.layout, area.into_entries()).await;
        }
    }

    async fn after_purge(&self, id: BlobIdentity) -> Result<()> {
        purge_local(&self.layout, id, self.keep_history).await
    }

    async fn copy_forward(&mut self, _copied: &[(u64, u64)], _revision_id: u64) -> Result<()> {
        // The database copies the rows; the cache fills in on the next load.
        self.txn.staging("copy_forward").map(|_| ())
    }

    async fn close(&self) {
        self.controller.wait_quiesced().await;
    }
}
