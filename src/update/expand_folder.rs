//! Expand-folder update
//!
//! Grows a folder's slot count and data file. Nothing is placed in the new
//! slots until the update is released, so recovery can always revert it.

use std::collections::BTreeSet;
use std::fmt;
use std::iter;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::storage::{FolderId, FolderState, FolderStatus, ResourceLock, StorageManager};
use crate::wal::{OpName, Operation, Transaction};

use super::{decode_intent, open_txn, settle, Outcome, Resolution, Target, Update};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpandIntent {
    folder_id: FolderId,
    path: PathBuf,
    prev_num_sectors: u64,
    target: u64,
}

pub struct ExpandFolderUpdate {
    path: PathBuf,
    target: u64,
    intent: Option<ExpandIntent>,
    /// Folder state before `prepare`
    prev_state: Option<FolderState>,
    txn: Option<Transaction>,
}

impl ExpandFolderUpdate {
    pub fn new(path: PathBuf, target: u64) -> Self {
        Self {
            path,
            target,
            intent: None,
            prev_state: None,
            txn: None,
        }
    }

    pub(crate) fn from_transaction(txn: Transaction) -> Result<Self> {
        let intent: ExpandIntent = decode_intent(&txn, OpName::ExpandFolder)?;
        Ok(Self {
            path: intent.path.clone(),
            target: intent.target,
            intent: Some(intent),
            prev_state: None,
            txn: Some(txn),
        })
    }

    fn intent(&self) -> Result<&ExpandIntent> {
        self.intent
            .as_ref()
            .ok_or_else(|| StoreError::Corruption("expand has no recorded intent".to_string()))
    }
}

impl fmt::Display for ExpandFolderUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expand folder {} to {} sectors",
            self.path.display(),
            self.target
        )
    }
}

impl Update for ExpandFolderUpdate {
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m> {
        manager.lock_exclusive()
    }

    fn record_intent(&mut self, manager: &StorageManager) -> Result<()> {
        let handle = manager
            .folders()
            .get_by_path(&self.path)
            .ok_or_else(|| StoreError::FolderNotFound(self.path.clone()))?;
        let max = manager.config().max_sectors_per_folder;

        let (folder_id, prev_num_sectors) = {
            let folder = handle.lock();
            if !folder.is_available() {
                return Err(StoreError::ResourceBusy(format!(
                    "folder {} is in the middle of another update",
                    self.path.display()
                )));
            }
            if self.target <= folder.num_sectors || self.target > max {
                return Err(StoreError::InvalidInput(format!(
                    "cannot grow folder {} from {} to {} sectors (limit {})",
                    self.path.display(),
                    folder.num_sectors,
                    self.target,
                    max
                )));
            }
            (folder.id, folder.num_sectors)
        };

        let intent = ExpandIntent {
            folder_id,
            path: self.path.clone(),
            prev_num_sectors,
            target: self.target,
        };
        self.txn = Some(
            manager
                .wal()
                .new_transaction(vec![Operation::encode(OpName::ExpandFolder, &intent)?])?,
        );
        self.intent = Some(intent);
        handle.lock().status = FolderStatus::Unavailable;
        Ok(())
    }

    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()> {
        let (folder_id, prev) = {
            let intent = self.intent()?;
            (intent.folder_id, intent.prev_num_sectors)
        };
        let handle = manager.folders().require(folder_id)?;
        let mut folder = handle.lock();

        match target {
            Target::Normal => {
                self.prev_state = Some(folder.state());
                folder.resize(self.target)
            }
            Target::RecoverCommitted => {
                folder.status = FolderStatus::Unavailable;
                if folder.num_sectors != prev {
                    folder.resize(prev)?;
                }
                Ok(())
            }
        }
    }

    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution> {
        let (folder_id, prev) = {
            let intent = self.intent()?;
            (intent.folder_id, intent.prev_num_sectors)
        };
        let data_file = manager.folders().require(folder_id)?.lock().data_file.clone();
        let touched: BTreeSet<FolderId> = iter::once(folder_id).collect();

        if target == Target::RecoverCommitted {
            data_file.set_len_sectors(prev)?;
            manager.write_batch(manager.db().new_batch(), &touched, &[])?;
            return Ok(Resolution::Reverted);
        }

        open_txn(&mut self.txn)?.commit()?;
        manager.disrupt("expand_folder/after_commit")?;

        data_file.set_len_sectors(self.target)?;
        manager.write_batch(manager.db().new_batch(), &touched, &[])?;

        info!(
            folder = folder_id,
            path = %self.path.display(),
            from = prev,
            to = self.target,
            "folder expanded"
        );
        Ok(Resolution::Finished)
    }

    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()> {
        let handle = self
            .intent
            .as_ref()
            .and_then(|i| manager.folders().get(i.folder_id));

        if let Some(handle) = handle {
            let mut folder = handle.lock();
            match outcome {
                Outcome::Completed(_) => folder.status = FolderStatus::Available,
                _ if self.is_committed() => {
                    // stays unavailable until recovery reverts the growth
                }
                _ => {
                    if let Some(state) = self.prev_state.take() {
                        folder.restore(state);
                    }
                    folder.status = FolderStatus::Available;
                }
            }
        }
        settle(manager, self.txn.take(), &outcome)
    }

    fn defer_to_recovery(&self, manager: &StorageManager) {
        if let Some(handle) = self
            .intent
            .as_ref()
            .and_then(|i| manager.folders().get(i.folder_id))
        {
            handle.lock().status = FolderStatus::Unavailable;
        }
        manager.mark_layout_awaiting_recovery();
    }

    fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }
}
