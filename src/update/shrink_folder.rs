//! Shrink-folder update
//!
//! Moves every sector out of the slots being dropped, then truncates the
//! data file. Once committed the shrink always finishes; recovery resumes
//! it from the logged relocations.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::index::IndexBatch;
use crate::storage::{FolderId, FolderState, FolderStatus, ResourceLock, StorageManager};
use crate::wal::{OpName, Operation, Transaction};

use super::relocate::{self, Relocation};
use super::{decode_intent, decode_ops, open_txn, settle, Outcome, Resolution, Target, Update};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShrinkIntent {
    folder_id: FolderId,
    path: PathBuf,
    prev_num_sectors: u64,
    target: u64,
}

pub struct ShrinkFolderUpdate {
    path: PathBuf,
    target: u64,

    intent: Option<ShrinkIntent>,
    /// Every folder's state before `prepare`, for unwinding
    snapshot: Option<Vec<(FolderId, FolderState)>>,
    moves: Vec<Relocation>,
    /// Moves whose bytes still need copying
    copies: Vec<Relocation>,
    batch: Option<IndexBatch>,
    txn: Option<Transaction>,
}

impl ShrinkFolderUpdate {
    pub fn new(path: PathBuf, target: u64) -> Self {
        Self {
            path,
            target,
            intent: None,
            snapshot: None,
            moves: Vec::new(),
            copies: Vec::new(),
            batch: None,
            txn: None,
        }
    }

    pub(crate) fn from_transaction(txn: Transaction) -> Result<Self> {
        let intent: ShrinkIntent = decode_intent(&txn, OpName::ShrinkFolder)?;
        let moves = decode_ops(&txn, OpName::RelocateSector)?;
        Ok(Self {
            path: intent.path.clone(),
            target: intent.target,
            intent: Some(intent),
            snapshot: None,
            moves,
            copies: Vec::new(),
            batch: None,
            txn: Some(txn),
        })
    }

    fn intent(&self) -> Result<&ShrinkIntent> {
        self.intent
            .as_ref()
            .ok_or_else(|| StoreError::Corruption("shrink has no recorded intent".to_string()))
    }

    fn prepare_normal(&mut self, manager: &StorageManager) -> Result<()> {
        let folder_id = self.intent()?.folder_id;
        self.snapshot = Some(manager.folders().snapshot());

        let moves = relocate::plan(manager, folder_id, self.target)?;
        let ops = moves
            .iter()
            .map(Relocation::to_operation)
            .collect::<Result<Vec<_>>>()?;
        open_txn(&mut self.txn)?.append_chunked(ops, manager.config().wal_ops_per_record)?;

        let mut batch = manager.db().new_batch();
        relocate::stage(&mut batch, &moves)?;
        manager.folders().require(folder_id)?.lock().resize(self.target)?;

        self.copies = moves.clone();
        self.moves = moves;
        self.batch = Some(batch);
        Ok(())
    }

    fn prepare_recover(&mut self, manager: &StorageManager) -> Result<()> {
        let folder_id = self.intent()?.folder_id;
        let handle = manager.folders().require(folder_id)?;
        handle.lock().status = FolderStatus::Unavailable;

        let mut batch = manager.db().new_batch();
        self.copies = relocate::restage(manager, &mut batch, &self.moves)?;

        let mut folder = handle.lock();
        if folder.num_sectors > self.target {
            folder.resize(self.target)?;
        }
        self.batch = Some(batch);
        Ok(())
    }

    fn set_status(&self, manager: &StorageManager, status: FolderStatus) {
        if let Some(folder_id) = self.intent.as_ref().map(|i| i.folder_id) {
            if let Some(handle) = manager.folders().get(folder_id) {
                handle.lock().status = status;
            }
        }
    }
}

impl fmt::Display for ShrinkFolderUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shrink folder {} to {} sectors",
            self.path.display(),
            self.target
        )
    }
}

impl Update for ShrinkFolderUpdate {
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m> {
        manager.lock_exclusive()
    }

    fn record_intent(&mut self, manager: &StorageManager) -> Result<()> {
        manager.check_layout_settled()?;
        let handle = manager
            .folders()
            .get_by_path(&self.path)
            .ok_or_else(|| StoreError::FolderNotFound(self.path.clone()))?;

        let (folder_id, prev_num_sectors, displaced, room_here) = {
            let folder = handle.lock();
            if !folder.is_available() {
                return Err(StoreError::ResourceBusy(format!(
                    "folder {} is in the middle of another update",
                    self.path.display()
                )));
            }
            if self.target == 0 || self.target >= folder.num_sectors {
                return Err(StoreError::InvalidInput(format!(
                    "cannot shrink folder {} from {} to {} sectors",
                    self.path.display(),
                    folder.num_sectors,
                    self.target
                )));
            }
            (
                folder.id,
                folder.num_sectors,
                folder.used_from(self.target),
                folder.free_below(self.target),
            )
        };

        let room = room_here + manager.folders().free_capacity(folder_id);
        if displaced > room {
            return Err(StoreError::InvalidInput(format!(
                "shrinking folder {} displaces {} sectors but only {} free slots remain",
                self.path.display(),
                displaced,
                room
            )));
        }

        let intent = ShrinkIntent {
            folder_id,
            path: self.path.clone(),
            prev_num_sectors,
            target: self.target,
        };
        self.txn = Some(
            manager
                .wal()
                .new_transaction(vec![Operation::encode(OpName::ShrinkFolder, &intent)?])?,
        );
        self.intent = Some(intent);
        handle.lock().status = FolderStatus::Unavailable;
        Ok(())
    }

    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()> {
        match target {
            Target::Normal => self.prepare_normal(manager),
            Target::RecoverCommitted => self.prepare_recover(manager),
        }
    }

    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution> {
        let (folder_id, prev_num_sectors) = {
            let intent = self.intent()?;
            (intent.folder_id, intent.prev_num_sectors)
        };
        let batch = self
            .batch
            .take()
            .ok_or_else(|| StoreError::Corruption("shrink has no staged batch".to_string()))?;
        let normal = target == Target::Normal;

        if normal {
            open_txn(&mut self.txn)?.commit()?;
            manager.disrupt("shrink_folder/after_commit")?;
        }

        relocate::copy(manager, &self.copies)?;
        if normal {
            manager.disrupt("shrink_folder/after_copy")?;
        }

        let mut touched = relocate::targets(&self.moves);
        touched.insert(folder_id);
        manager.write_batch(batch, &touched, &[])?;
        if normal {
            manager.disrupt("shrink_folder/before_truncate")?;
        }

        let data_file = manager.folders().require(folder_id)?.lock().data_file.clone();
        data_file.set_len_sectors(self.target)?;

        info!(
            folder = folder_id,
            path = %self.path.display(),
            from = prev_num_sectors,
            to = self.target,
            relocated = self.moves.len(),
            "folder shrunk"
        );
        Ok(Resolution::Finished)
    }

    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()> {
        match outcome {
            Outcome::Completed(_) => self.set_status(manager, FolderStatus::Available),
            _ if self.is_committed() => {
                // stays unavailable until recovery finishes the shrink
            }
            _ => {
                if let Some(snapshot) = self.snapshot.take() {
                    manager.folders().restore(snapshot);
                }
                self.set_status(manager, FolderStatus::Available);
            }
        }
        settle(manager, self.txn.take(), &outcome)
    }

    fn defer_to_recovery(&self, manager: &StorageManager) {
        self.set_status(manager, FolderStatus::Unavailable);
        manager.mark_layout_awaiting_recovery();
    }

    fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }
}
