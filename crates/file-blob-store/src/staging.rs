//! Per-transaction bookkeeping of staged blob files

use crate::error::{BlobStoreError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Staging,
    Voted,
}

/// Staged files of the one transaction in flight on a handle, keyed by
/// object id. A later `stage` for the same object replaces the earlier entry.
#[derive(Debug)]
pub struct TransactionStagingArea {
    phase: TxnPhase,
    revision_id: Option<u64>,
    entries: HashMap<u64, PathBuf>,
}

impl TransactionStagingArea {
    fn new() -> Self {
        Self {
            phase: TxnPhase::Staging,
            revision_id: None,
            entries: HashMap::new(),
        }
    }

    pub fn phase(&self) -> TxnPhase {
        self.phase
    }

    /// Revision handed to `vote`, if it has happened
    pub fn revision_id(&self) -> Option<u64> {
        self.revision_id
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, object_id: u64) -> Option<&Path> {
        self.entries.get(&object_id).map(PathBuf::as_path)
    }

    /// Register `path` for `object_id`, returning the file it displaced.
    pub fn stage(&mut self, object_id: u64, path: PathBuf) -> Option<PathBuf> {
        let old = self.entries.insert(object_id, path.clone())?;
        (old != path).then_some(old)
    }

    /// Point an entry at the place its file was moved to.
    pub fn relocate(&mut self, object_id: u64, path: PathBuf) {
        self.entries.insert(object_id, path);
    }

    /// Snapshot of the entries, for callers that move files while updating
    /// the area.
    pub fn entries(&self) -> Vec<(u64, PathBuf)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(oid, path)| (*oid, path.clone()))
            .collect();
        entries.sort_by_key(|(oid, _)| *oid);
        entries
    }

    pub fn into_entries(self) -> Vec<(u64, PathBuf)> {
        let mut entries: Vec<_> = self.entries.into_iter().collect();
        entries.sort_by_key(|(oid, _)| *oid);
        entries
    }
}

/// The begin/vote/finish/abort state machine of one handle.
///
/// Holds at most one staging area; `None` is the idle state.
#[derive(Debug, Default)]
pub struct TransactionSlot {
    open: Option<TransactionStagingArea>,
}

impl TransactionSlot {
    pub fn begin(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Err(BlobStoreError::protocol(
                "begin called while a transaction is already open",
            ));
        }
        self.open = Some(TransactionStagingArea::new());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn has_blobs(&self) -> bool {
        self.open.as_ref().is_some_and(|area| !area.is_empty())
    }

    /// The open area, which must not have voted yet.
    pub fn staging(&mut self, operation: &str) -> Result<&mut TransactionStagingArea> {
        match self.open.as_mut() {
            Some(area) if area.phase == TxnPhase::Staging => Ok(area),
            Some(_) => Err(BlobStoreError::protocol(format!(
                "{} called after vote",
                operation
            ))),
            None => Err(BlobStoreError::protocol(format!(
                "{} called outside a transaction",
                operation
            ))),
        }
    }

    pub fn vote(&mut self, revision_id: u64) -> Result<&mut TransactionStagingArea> {
        let area = self.staging("vote")?;
        area.phase = TxnPhase::Voted;
        area.revision_id = Some(revision_id);
        Ok(area)
    }

    /// Close a voted transaction and hand back its area.
    ///
    /// A second call finds the slot idle and fails without touching files.
    pub fn finish(&mut self) -> Result<TransactionStagingArea> {
        match self.open.take() {
            Some(area) if area.phase == TxnPhase::Voted => Ok(area),
            Some(area) => {
                self.open = Some(area);
                Err(BlobStoreError::protocol("finish called before vote"))
            }
            None => Err(BlobStoreError::protocol(
                "finish called outside a transaction",
            )),
        }
    }

    /// The open area in whatever phase it is in
    pub fn area_mut(&mut self) -> Option<&mut TransactionStagingArea> {
        self.open.as_mut()
    }

    pub fn abort(&mut self) -> Option<TransactionStagingArea> {
        self.open.take()
    }
}
