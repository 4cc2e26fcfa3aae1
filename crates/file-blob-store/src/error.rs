//! Error types for the file blob store

use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum BlobStoreError {
    /// begin/store/vote/finish called out of order
    Protocol(String),
    LockTimeout(PathBuf),
    NotFound { object_id: u64, revision_id: u64 },
    InsufficientSpace(Box<io::Error>),
    Io(Box<io::Error>),
    InvalidLayout { expected: String, found: String },
    InvalidConfig(String),
    RemoteFetchFailed(String),
    RemoteUploadFailed(String),
    Unsupported(String),
}

impl BlobStoreError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        BlobStoreError::Protocol(msg.into())
    }

    pub(crate) fn not_found(object_id: u64, revision_id: u64) -> Self {
        BlobStoreError::NotFound {
            object_id,
            revision_id,
        }
    }

    /// Classify an I/O failure from a write path, where a full disk gets
    /// its own variant.
    pub(crate) fn from_write(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            BlobStoreError::InsufficientSpace(Box::new(err))
        } else {
            BlobStoreError::Io(Box::new(err))
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobStoreError::NotFound { .. })
    }
}

impl fmt::Display for BlobStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobStoreError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            BlobStoreError::LockTimeout(path) => {
                write!(f, "Timed out waiting for lock {}", path.display())
            }
            BlobStoreError::NotFound {
                object_id,
                revision_id,
            } => write!(
                f,
                "No blob file for object {} revision {:016x}",
                object_id, revision_id
            ),
            BlobStoreError::InsufficientSpace(err) => write!(f, "Insufficient space: {}", err),
            BlobStoreError::Io(err) => write!(f, "IO error: {}", err),
            BlobStoreError::InvalidLayout { expected, found } => write!(
                f,
                "Invalid blob directory layout: expected {:?}, found {:?}",
                expected, found
            ),
            BlobStoreError::InvalidConfig(msg) => write!(f, "Configuration error: {}", msg),
            BlobStoreError::RemoteFetchFailed(msg) => write!(f, "Remote fetch failed: {}", msg),
            BlobStoreError::RemoteUploadFailed(msg) => write!(f, "Remote upload failed: {}", msg),
            BlobStoreError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for BlobStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobStoreError::InsufficientSpace(err) => Some(err.as_ref()),
            BlobStoreError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for BlobStoreError {
    fn from(err: io::Error) -> Self {
        BlobStoreError::Io(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for BlobStoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        BlobStoreError::Io(Box::new(io::Error::other(err)))
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;
