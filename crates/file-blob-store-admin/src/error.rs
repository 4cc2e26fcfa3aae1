//! Error types for the blob store admin tool

use file_blob_store::BlobStoreError;
use std::fmt;

#[derive(Debug)]
pub enum AdminError {
    Store(Box<BlobStoreError>),
    Io(Box<std::io::Error>),
    Json(Box<serde_json::Error>),
    Config(String),
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminError::Store(err) => write!(f, "Blob store error: {}", err),
            AdminError::Io(err) => write!(f, "IO error: {}", err),
            AdminError::Json(err) => write!(f, "JSON error: {}", err),
            AdminError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdminError::Store(err) => Some(err.as_ref()),
            AdminError::Io(err) => Some(err.as_ref()),
            AdminError::Json(err) => Some(err.as_ref()),
            AdminError::Config(_) => None,
        }
    }
}

impl From<BlobStoreError> for AdminError {
    fn from(err: BlobStoreError) -> Self {
        AdminError::Store(Box::new(err))
    }
}

impl From<std::io::Error> for AdminError {
    fn from(err: std::io::Error) -> Self {
        AdminError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for AdminError {
    fn from(err: serde_json::Error) -> Self {
        AdminError::Json(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for AdminError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        AdminError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AdminError {
    fn from(err: tokio::task::JoinError) -> Self {
        AdminError::Io(Box::new(std::io::Error::other(err)))
    }
}

pub type Result<T> = std::result::Result<T, AdminError>;
