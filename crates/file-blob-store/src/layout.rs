//! Mapping from blob identity to path inside a blob directory
//!
//! Objects are spread over `SHARD_COUNT` subdirectories named by
//! `object_id % SHARD_COUNT`; inside a shard the file name carries the
//! quotient and the hex revision, so the mapping is injective.

use crate::error::{BlobStoreError, Result};
use crate::types::BlobIdentity;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub const SHARD_COUNT: u64 = 997;
pub const LAYOUT_NAME: &str = "blobcache-997";
pub const LAYOUT_MARKER: &str = ".layout";
pub const SCAN_LOCK_NAME: &str = "check_size.lock";
pub const TEMP_DIR_NAME: &str = "tmp";
pub const BLOB_SUFFIX: &str = ".blob";
pub const LOCK_SUFFIX: &str = ".lock";
pub const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct BlobLayout {
    root: PathBuf,
}

impl BlobLayout {
    /// Open a blob directory, creating it and its layout marker on first use.
    ///
    /// A directory whose marker names another layout is refused with
    /// `InvalidLayout`.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Self { root: root.into() };
        fs::create_dir_all(&layout.root).await?;
        fs::create_dir_all(layout.temp_dir()).await?;

        let marker = layout.root.join(LAYOUT_MARKER);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(mut file) => {
                file.write_all(format!("{}\n", LAYOUT_NAME).as_bytes())
                    .await?;
                file.flush().await?;
                info!(root = %layout.root.display(), layout = LAYOUT_NAME, "Created blob directory");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => layout.validate().await?,
            Err(e) => return Err(e.into()),
        }
        Ok(layout)
    }

    /// Open a blob directory that must already carry a matching marker.
    pub async fn open_existing(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Self { root: root.into() };
        layout.validate().await?;
        Ok(layout)
    }

    async fn validate(&self) -> Result<()> {
        let marker = self.root.join(LAYOUT_MARKER);
        let found = match fs::read_to_string(&marker).await {
            Ok(content) => content.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if found != LAYOUT_NAME {
            return Err(BlobStoreError::InvalidLayout {
                expected: LAYOUT_NAME.to_string(),
                found,
            });
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch space on the same filesystem as the blobs
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR_NAME)
    }

    pub fn scan_lock_path(&self) -> PathBuf {
        self.root.join(SCAN_LOCK_NAME)
    }

    pub fn shard_dir(&self, object_id: u64) -> PathBuf {
        self.root.join((object_id % SHARD_COUNT).to_string())
    }

    pub fn path_for(&self, id: &BlobIdentity) -> PathBuf {
        self.shard_dir(id.object_id)
            .join(format!("{}{}", file_stem(id), BLOB_SUFFIX))
    }

    pub fn lock_path_for(&self, id: &BlobIdentity) -> PathBuf {
        self.shard_dir(id.object_id)
            .join(format!("{}{}", file_stem(id), LOCK_SUFFIX))
    }

    /// Create the shard directory for `object_id` if it is missing.
    pub async fn ensure_directory_for(&self, object_id: u64) -> Result<PathBuf> {
        let dir = self.shard_dir(object_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Recover the identity of a blob file from its shard and file name.
    pub fn parse_blob_name(shard: &str, file_name: &str) -> Option<BlobIdentity> {
        let shard: u64 = shard.parse().ok()?;
        if shard >= SHARD_COUNT {
            return None;
        }
        let stem = file_name.strip_suffix(BLOB_SUFFIX)?;
        let (quotient, revision) = stem.split_once('.')?;
        if revision.len() != 16 {
            return None;
        }
        let quotient: u64 = quotient.parse().ok()?;
        let revision_id = u64::from_str_radix(revision, 16).ok()?;
        let object_id = quotient.checked_mul(SHARD_COUNT)?.checked_add(shard)?;
        Some(BlobIdentity::new(object_id, revision_id))
    }
}

/// File name prefix shared by every revision of one object
pub fn object_prefix(object_id: u64) -> String {
    format!("{}.", object_id / SHARD_COUNT)
}

pub fn is_shard_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn file_stem(id: &BlobIdentity) -> String {
    format!("{}{:016x}", object_prefix(id.object_id), id.revision_id)
}
