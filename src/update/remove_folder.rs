//! Remove-folder update
//!
//! Moves every sector of a folder into the other folders, drops the
//! folder's rows and deletes its data file last. Once committed the
//! removal always finishes.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::index::IndexBatch;
use crate::storage::{
    FolderId, FolderState, FolderStatus, ResourceLock, StorageFolder, StorageManager,
};
use crate::wal::{OpName, Operation, Transaction};

use super::relocate::{self, Relocation};
use super::{decode_intent, decode_ops, open_txn, settle, Outcome, Resolution, Target, Update};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoveFolderIntent {
    folder_id: FolderId,
    path: PathBuf,
}

pub struct RemoveFolderUpdate {
    path: PathBuf,
    intent: Option<RemoveFolderIntent>,
    snapshot: Option<Vec<(FolderId, FolderState)>>,
    moves: Vec<Relocation>,
    copies: Vec<Relocation>,
    batch: Option<IndexBatch>,
    txn: Option<Transaction>,
}

impl RemoveFolderUpdate {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            intent: None,
            snapshot: None,
            moves: Vec::new(),
            copies: Vec::new(),
            batch: None,
            txn: None,
        }
    }

    pub(crate) fn from_transaction(txn: Transaction) -> Result<Self> {
        let intent: RemoveFolderIntent = decode_intent(&txn, OpName::RemoveFolder)?;
        let moves = decode_ops(&txn, OpName::RelocateSector)?;
        Ok(Self {
            path: intent.path.clone(),
            intent: Some(intent),
            snapshot: None,
            moves,
            copies: Vec::new(),
            batch: None,
            txn: Some(txn),
        })
    }

    fn folder_id(&self) -> Result<FolderId> {
        self.intent
            .as_ref()
            .map(|i| i.folder_id)
            .ok_or_else(|| StoreError::Corruption("remove folder has no recorded intent".to_string()))
    }

    /// The folder row still belongs to this folder and not to one added
    /// later under the same id
    fn owns_folder_row(&self, manager: &StorageManager) -> Result<bool> {
        let folder_id = self.folder_id()?;
        Ok(manager
            .db()
            .get_folder(folder_id)?
            .is_some_and(|record| record.path == self.path))
    }
}

impl fmt::Display for RemoveFolderUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remove folder {}", self.path.display())
    }
}

impl Update for RemoveFolderUpdate {
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m> {
        manager.lock_exclusive()
    }

    fn record_intent(&mut self, manager: &StorageManager) -> Result<()> {
        manager.check_layout_settled()?;
        let handle = manager
            .folders()
            .get_by_path(&self.path)
            .ok_or_else(|| StoreError::FolderNotFound(self.path.clone()))?;

        let (folder_id, stored) = {
            let folder = handle.lock();
            if !folder.is_available() {
                return Err(StoreError::ResourceBusy(format!(
                    "folder {} is in the middle of another update",
                    self.path.display()
                )));
            }
            (folder.id, folder.stored_sectors())
        };
        if stored > manager.folders().free_capacity(folder_id) {
            return Err(StoreError::Full);
        }

        let intent = RemoveFolderIntent {
            folder_id,
            path: self.path.clone(),
        };
        self.txn = Some(
            manager
                .wal()
                .new_transaction(vec![Operation::encode(OpName::RemoveFolder, &intent)?])?,
        );
        self.intent = Some(intent);
        handle.lock().status = FolderStatus::Unavailable;
        Ok(())
    }

    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()> {
        let folder_id = self.folder_id()?;
        let mut batch = manager.db().new_batch();

        match target {
            Target::Normal => {
                self.snapshot = Some(manager.folders().snapshot());
                let moves = relocate::plan(manager, folder_id, 0)?;
                let ops = moves
                    .iter()
                    .map(Relocation::to_operation)
                    .collect::<Result<Vec<_>>>()?;
                open_txn(&mut self.txn)?.append_chunked(ops, manager.config().wal_ops_per_record)?;
                relocate::stage(&mut batch, &moves)?;
                self.copies = moves.clone();
                self.moves = moves;
            }
            Target::RecoverCommitted => {
                // the folder is gone from the index if the batch already landed
                if let Some(handle) = manager.folders().get(folder_id) {
                    handle.lock().status = FolderStatus::Unavailable;
                }
                self.copies = relocate::restage(manager, &mut batch, &self.moves)?;
            }
        }

        if self.owns_folder_row(manager)? {
            batch.delete_folder(folder_id, &self.path);
        }
        self.batch = Some(batch);
        Ok(())
    }

    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution> {
        let folder_id = self.folder_id()?;
        let batch = self
            .batch
            .take()
            .ok_or_else(|| StoreError::Corruption("remove folder has no staged batch".to_string()))?;
        let normal = target == Target::Normal;

        if normal {
            open_txn(&mut self.txn)?.commit()?;
            manager.disrupt("remove_folder/after_commit")?;
        }

        relocate::copy(manager, &self.copies)?;
        if normal {
            manager.disrupt("remove_folder/after_copy")?;
        }

        // the removed folder's own row must not be written back
        let mut touched = relocate::targets(&self.moves);
        touched.remove(&folder_id);
        manager.write_batch(batch, &touched, &[])?;
        let loaded = manager
            .folders()
            .get(folder_id)
            .is_some_and(|f| f.lock().path == self.path);
        if loaded {
            manager.folders().remove(folder_id);
        }

        match fs::remove_file(StorageFolder::data_file_path(&self.path)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            folder = folder_id,
            path = %self.path.display(),
            relocated = self.moves.len(),
            "folder removed"
        );
        Ok(Resolution::Finished)
    }

    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()> {
        if outcome.is_failure() && !self.is_committed() {
            if let Some(snapshot) = self.snapshot.take() {
                manager.folders().restore(snapshot);
            }
            if let Some(handle) = self
                .intent
                .as_ref()
                .and_then(|i| manager.folders().get(i.folder_id))
            {
                handle.lock().status = FolderStatus::Available;
            }
        }
        settle(manager, self.txn.take(), &outcome)
    }

    fn defer_to_recovery(&self, manager: &StorageManager) {
        if let Some(intent) = self.intent.as_ref() {
            if let Some(handle) = manager.folders().get(intent.folder_id) {
                let mut folder = handle.lock();
                if folder.path == intent.path {
                    folder.status = FolderStatus::Unavailable;
                }
            }
        }
        manager.mark_layout_awaiting_recovery();
    }

    fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }
}
