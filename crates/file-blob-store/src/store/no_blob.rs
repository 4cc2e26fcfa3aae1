use super::{BlobHandle, CommitCallback};
use crate::error::{BlobStoreError, Result};
use crate::remote::RemoteBlobStore;
use crate::staging::TransactionSlot;
use crate::types::BlobIdentity;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

const DISABLED: &str = "No blob directory is configured";

/// Handle for storages without a blob directory. Transactions still work;
/// anything touching blob bytes is refused.
#[derive(Default)]
pub struct NoBlobStore {
    txn: TransactionSlot,
}

impl NoBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobHandle for NoBlobStore {
    fn new_instance(&self, _remote: Arc<dyn RemoteBlobStore>) -> Box<dyn BlobHandle> {
        Box::new(NoBlobStore::new())
    }

    fn temporary_directory(&self) -> Option<PathBuf> {
        None
    }

    fn txn_has_blobs(&self) -> bool {
        false
    }

    fn begin(&mut self) -> Result<()> {
        self.txn.begin()
    }

    async fn store(
        &mut self,
        _object_id: u64,
        _source: &Path,
        _commit: CommitCallback<'_>,
    ) -> Result<PathBuf> {
        Err(BlobStoreError::Unsupported(DISABLED.to_string()))
    }

    async fn load(&self, _id: BlobIdentity) -> Result<PathBuf> {
        Err(BlobStoreError::Unsupported(DISABLED.to_string()))
    }

    async fn open(&self, _id: BlobIdentity) -> Result<fs::File> {
        Err(BlobStoreError::Unsupported(DISABLED.to_string()))
    }

    async fn restore_blob(&self, _id: BlobIdentity, _source: &Path) -> Result<()> {
        Err(BlobStoreError::Unsupported(DISABLED.to_string()))
    }

    async fn vote(&mut self, revision_id: u64) -> Result<()> {
        self.txn.vote(revision_id).map(|_| ())
    }

    async fn finish(&mut self, _revision_id: u64) -> Result<()> {
        self.txn.finish().map(|_| ())
    }

    async fn abort(&mut self) {
        self.txn.abort();
    }

    async fn after_purge(&self, _id: BlobIdentity) -> Result<()> {
        Ok(())
    }

    async fn copy_forward(&mut self, _copied: &[(u64, u64)], _revision_id: u64) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_blob_operations_are_unsupported() {
        let dir = tempdir().unwrap();
        let source = source_file(dir.path(), "a", b"x").await;
        let mut store = NoBlobStore::new();

        store.begin().unwrap();
        assert!(matches!(
            store.store(1, &source, no_commit()).await,
            Err(BlobStoreError::Unsupported(_))
        ));
        assert!(matches!(
            store.open(BlobIdentity::new(1, 1)).await,
            Err(BlobStoreError::Unsupported(_))
        ));
        assert!(matches!(
            store.restore_blob(BlobIdentity::new(1, 1), &source).await,
            Err(BlobStoreError::Unsupported(_))
        ));
        // The source is left alone.
        assert!(source.exists());
        assert!(!store.txn_has_blobs());
    }

    #[tokio::test]
    async fn test_transactions_still_follow_protocol() {
        let mut store = NoBlobStore::new();

        assert!(matches!(store.finish(1).await, Err(BlobStoreError::Protocol(_))));
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(BlobStoreError::Protocol(_))));
        store.vote(1).await.unwrap();
        store.finish(1).await.unwrap();

        store.begin().unwrap();
        store.abort().await;
        store.begin().unwrap();

        store.after_purge(BlobIdentity::new(1, 1)).await.unwrap();
        store.copy_forward(&[(1, 1)], 2).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_new_instance_is_independent() {
        let mut store = NoBlobStore::new();
        store.begin().unwrap();

        let mut other = store.new_instance(remote());
        other.begin().unwrap();
        assert!(other.temporary_directory().is_none());
    }
}
