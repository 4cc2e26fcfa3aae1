//! Admin commands over a blob directory

use crate::error::{AdminError, Result};
use file_blob_store::config::parse_byte_size;
use file_blob_store::layout::LAYOUT_NAME;
use file_blob_store::{
    directory_stats, BlobLayout, BlobStoreOptions, Budget, DirectoryStats, EvictionReport,
    EvictionScanner,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct VerifyOutcome {
    pub dir: PathBuf,
    pub layout: &'static str,
    pub status: &'static str,
}

/// Count and size the blob files of an existing directory.
pub async fn stats(dir: &Path) -> Result<DirectoryStats> {
    let layout = BlobLayout::open_existing(dir).await?;
    let stats = tokio::task::spawn_blocking(move || directory_stats(&layout)).await?;
    info!(dir = %dir.display(), files = stats.files, total_size = stats.total_size, "Counted blob files");
    Ok(stats)
}

/// Run one eviction pass down to the budget's target size.
pub async fn shrink(dir: &Path, max_bytes: u64, check_percent: u8) -> Result<EvictionReport> {
    let budget = Budget::new(max_bytes, check_percent)?;
    let layout = BlobLayout::open_existing(dir).await?;
    let scanner = EvictionScanner::new(layout, budget.target_size);
    let report = tokio::task::spawn_blocking(move || scanner.run()).await??;
    Ok(report)
}

/// Check the layout marker, writing it if the directory is new.
pub async fn verify(dir: &Path) -> Result<VerifyOutcome> {
    BlobLayout::create(dir).await?;
    Ok(VerifyOutcome {
        dir: dir.to_path_buf(),
        layout: LAYOUT_NAME,
        status: "ok",
    })
}

/// The directory from the command line, or `BLOB_CACHE_DIR`.
pub fn resolve_dir(arg: Option<PathBuf>, env: &BlobStoreOptions) -> Result<PathBuf> {
    arg.or_else(|| env.cache_directory.clone()).ok_or_else(|| {
        AdminError::Config("pass --dir or set BLOB_CACHE_DIR".to_string())
    })
}

/// The size cap from the command line, or `BLOB_CACHE_SIZE`.
pub fn resolve_max_bytes(arg: Option<&str>, env: &BlobStoreOptions) -> Result<u64> {
    let parsed = match arg {
        Some(value) => parse_byte_size(value)?,
        None => env.max_cache_bytes,
    };
    parsed.ok_or_else(|| {
        AdminError::Config("shrink needs a size limit; pass --max-bytes or set BLOB_CACHE_SIZE".to_string())
    })
}
