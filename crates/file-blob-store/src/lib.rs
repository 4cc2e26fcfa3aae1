//! Transactional file-backed blob storage
//!
//! Blobs live in a sharded directory, one file per object revision. The
//! directory is either shared by every client as the canonical store, or a
//! private size-limited cache of a remote store that is filled on demand and
//! shrunk by least-recently-used eviction. Writes are staged per transaction
//! and only become visible under their final names on vote or finish.

pub mod budget;
pub mod config;
pub mod error;
pub mod eviction;
pub mod layout;
pub mod lock;
pub mod remote;
pub mod staging;
pub mod store;
pub mod types;

pub use budget::{Budget, CacheBudgetController};
pub use config::BlobStoreOptions;
pub use error::{BlobStoreError, Result};
pub use eviction::{directory_stats, EvictionScanner};
pub use layout::BlobLayout;
pub use lock::FileLock;
pub use remote::{RemoteBlobStore, RemoteError};
pub use staging::{TransactionSlot, TransactionStagingArea, TxnPhase};
pub use store::{
    open_blob_store, BlobHandle, CacheBlobStore, CommitCallback, NoBlobStore, SharedBlobStore,
};
pub use types::{BlobIdentity, DirectoryStats, EvictionReport};
