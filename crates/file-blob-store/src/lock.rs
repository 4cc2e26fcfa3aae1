//! Cross-process advisory file locks
//!
//! A lock is an exclusive `flock` on a marker file. A holder may unlink the
//! marker before releasing it with [`FileLock::remove`]; anyone who locked
//! the old inode meanwhile notices the path no longer names it and starts
//! over on the new file.

use crate::error::{BlobStoreError, Result};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
/// About a minute of polling at `LOCK_RETRY_INTERVAL`
pub const LOCK_MAX_ATTEMPTS: u32 = 6000;

/// Handle to an acquired lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Try once to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when another holder has it. A parent directory
    /// removed by a concurrent cleanup is created again.
    pub fn try_acquire(path: &Path) -> Result<Option<FileLock>> {
        loop {
            let file = open_marker(path)?;
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {}
                Err(err) if is_contended(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
            if !still_linked(&file, path)? {
                debug!(path = %path.display(), "Lock marker was replaced, retrying");
                continue;
            }
            record_holder(&file);
            return Ok(Some(FileLock {
                path: path.to_path_buf(),
                file: Some(file),
            }));
        }
    }

    /// Take the lock at `path`, polling until the default retry budget runs out.
    pub async fn acquire(path: &Path) -> Result<FileLock> {
        Self::acquire_with(path, LOCK_RETRY_INTERVAL, LOCK_MAX_ATTEMPTS).await
    }

    pub async fn acquire_with(path: &Path, interval: Duration, attempts: u32) -> Result<FileLock> {
        for attempt in 0..attempts.max(1) {
            if let Some(lock) = Self::try_acquire(path)? {
                if attempt > 0 {
                    debug!(path = %path.display(), attempt, "Acquired contended lock");
                }
                return Ok(lock);
            }
            tokio::time::sleep(interval).await;
        }
        warn!(path = %path.display(), attempts, "Gave up waiting for lock");
        Err(BlobStoreError::LockTimeout(path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Unlink the marker file, then release the lock.
    pub fn remove(mut self) {
        if self.file.is_some() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!(path = %self.path.display(), error = %e, "Could not remove lock marker"),
            }
        }
        self.release();
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                debug!(path = %self.path.display(), error = %e, "Unlock failed, closing instead");
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_marker(path: &Path) -> io::Result<File> {
    let open = || {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
    };
    match open() {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            open()
        }
        other => other,
    }
}

/// Whether `path` still names the inode `file` was opened on.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Open files cannot be unlinked here, so the path always names the held file.
#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

// Holder pid and time, for whoever inspects a stuck lock by hand.
fn record_holder(mut file: &File) {
    let _ = file.set_len(0);
    let _ = writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339());
}
