//! Interface to the database that holds canonical blob bytes in cache mode

use async_trait::async_trait;
use std::path::Path;

pub type RemoteError = Box<dyn std::error::Error + Send + Sync>;

/// The row mover that copies blob bytes between the database and files.
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Write the blob's bytes to `target` and return how many were written.
    ///
    /// A blob the database does not have yields `Ok(0)` and no file.
    async fn download_blob(
        &self,
        object_id: u64,
        revision_id: u64,
        target: &Path,
    ) -> Result<u64, RemoteError>;

    /// Upload `source`. A `None` revision targets the pending-transaction
    /// area; the database moves it to the real revision on commit.
    async fn upload_blob(
        &self,
        object_id: u64,
        revision_id: Option<u64>,
        source: &Path,
    ) -> Result<(), RemoteError>;
}
