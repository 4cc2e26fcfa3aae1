//! Blob store types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A committed blob: one object at one revision.
///
/// Neither id is ever reused once committed. Blobs that are staged but not
/// yet committed are addressed by their object id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobIdentity {
    pub object_id: u64,
    pub revision_id: u64,
}

impl BlobIdentity {
    pub fn new(object_id: u64, revision_id: u64) -> Self {
        Self {
            object_id,
            revision_id,
        }
    }
}

impl fmt::Display for BlobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:016x}", self.object_id, self.revision_id)
    }
}

/// Size of a blob directory as seen by one walk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub files: usize,
    pub total_size: u64,
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionReport {
    pub started_at: DateTime<Utc>,
    pub target_size: u64,
    pub initial_size: u64,
    pub final_size: u64,
    pub removed_files: usize,
    pub skipped_locked: usize,
    /// False when another scanner held the directory lock
    pub ran: bool,
}

impl EvictionReport {
    pub(crate) fn skipped(target_size: u64) -> Self {
        Self {
            started_at: Utc::now(),
            target_size,
            initial_size: 0,
            final_size: 0,
            removed_files: 0,
            skipped_locked: 0,
            ran: false,
        }
    }

    pub fn over_target(&self) -> bool {
        self.ran && self.final_size > self.target_size
    }
}
