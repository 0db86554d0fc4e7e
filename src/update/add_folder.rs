//! Add-folder update
//!
//! Creates a folder's data file, persists its row and makes it available
//! for placement. The data file is created only after commit; a committed
//! add the caller never saw finish is reverted by recovery.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::index::IndexBatch;
use crate::storage::{
    DataFile, FolderId, FolderRecord, FolderStatus, ResourceLock, StorageFolder, StorageManager,
};
use crate::wal::{OpName, Operation, Transaction};

use super::{decode_intent, open_txn, settle, Outcome, Resolution, Target, Update};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddFolderIntent {
    folder_id: FolderId,
    path: PathBuf,
    num_sectors: u64,
}

pub struct AddFolderUpdate {
    path: PathBuf,
    num_sectors: u64,
    intent: Option<AddFolderIntent>,
    batch: Option<IndexBatch>,
    txn: Option<Transaction>,
}

impl AddFolderUpdate {
    pub fn new(path: PathBuf, num_sectors: u64) -> Self {
        Self {
            path,
            num_sectors,
            intent: None,
            batch: None,
            txn: None,
        }
    }

    pub(crate) fn from_transaction(txn: Transaction) -> Result<Self> {
        let intent: AddFolderIntent = decode_intent(&txn, OpName::AddFolder)?;
        Ok(Self {
            path: intent.path.clone(),
            num_sectors: intent.num_sectors,
            intent: Some(intent),
            batch: None,
            txn: Some(txn),
        })
    }

    fn intent(&self) -> Result<&AddFolderIntent> {
        self.intent
            .as_ref()
            .ok_or_else(|| StoreError::Corruption("add folder has no recorded intent".to_string()))
    }

    fn owns_folder_row(&self, manager: &StorageManager) -> Result<bool> {
        let intent = self.intent()?;
        Ok(manager
            .db()
            .get_folder(intent.folder_id)?
            .is_some_and(|record| record.path == intent.path))
    }

    fn remove_data_file(&self) -> Result<()> {
        let file_path = StorageFolder::data_file_path(&self.path);
        match fs::remove_file(&file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for AddFolderUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "add folder {} with {} sectors",
            self.path.display(),
            self.num_sectors
        )
    }
}

impl Update for AddFolderUpdate {
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m> {
        manager.lock_exclusive()
    }

    fn record_intent(&mut self, manager: &StorageManager) -> Result<()> {
        let max = manager.config().max_sectors_per_folder;
        if self.num_sectors == 0 || self.num_sectors > max {
            return Err(StoreError::InvalidInput(format!(
                "folder must hold between 1 and {} sectors, asked for {}",
                max, self.num_sectors
            )));
        }
        if manager.folders().get_by_path(&self.path).is_some()
            || manager.db().folder_id_by_path(&self.path)?.is_some()
            || StorageFolder::data_file_path(&self.path).exists()
        {
            return Err(StoreError::PathInUse(self.path.clone()));
        }

        let intent = AddFolderIntent {
            folder_id: manager.folders().next_folder_id()?,
            path: self.path.clone(),
            num_sectors: self.num_sectors,
        };
        self.txn = Some(
            manager
                .wal()
                .new_transaction(vec![Operation::encode(OpName::AddFolder, &intent)?])?,
        );
        self.intent = Some(intent);
        Ok(())
    }

    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()> {
        let intent = self.intent()?.clone();
        let mut batch = manager.db().new_batch();
        match target {
            Target::Normal => {
                fs::create_dir_all(&intent.path)?;
                batch.save_folder(&FolderRecord::empty(
                    intent.folder_id,
                    intent.path,
                    intent.num_sectors,
                ))?;
            }
            Target::RecoverCommitted => {
                // the id may have been handed to a later folder
                if self.owns_folder_row(manager)? {
                    batch.delete_folder(intent.folder_id, &intent.path);
                }
            }
        }
        self.batch = Some(batch);
        Ok(())
    }

    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution> {
        let intent = self.intent()?.clone();
        let batch = self
            .batch
            .take()
            .ok_or_else(|| StoreError::Corruption("add folder has no staged batch".to_string()))?;

        if target == Target::RecoverCommitted {
            let loaded = manager
                .folders()
                .get(intent.folder_id)
                .is_some_and(|f| f.lock().path == intent.path);
            if loaded {
                manager.folders().remove(intent.folder_id);
                warn!(folder = intent.folder_id, "dropping folder from unfinished add");
            }
            manager.write_batch(batch, &BTreeSet::new(), &[])?;
            self.remove_data_file()?;
            return Ok(Resolution::Reverted);
        }

        open_txn(&mut self.txn)?.commit()?;
        manager.disrupt("add_folder/after_commit")?;

        let data_file = DataFile::create(
            &StorageFolder::data_file_path(&intent.path),
            intent.num_sectors,
            manager.sector_size(),
        )?;
        manager.disrupt("add_folder/after_create")?;

        manager.write_batch(batch, &BTreeSet::new(), &[])?;
        manager.folders().insert(StorageFolder::new(
            intent.folder_id,
            intent.path.clone(),
            intent.num_sectors,
            Arc::new(data_file),
        ));

        info!(
            folder = intent.folder_id,
            path = %intent.path.display(),
            num_sectors = intent.num_sectors,
            "folder added"
        );
        Ok(Resolution::Finished)
    }

    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()> {
        // A committed add that failed leaves its file for recovery to remove
        settle(manager, self.txn.take(), &outcome)
    }

    fn defer_to_recovery(&self, manager: &StorageManager) {
        // recovery drops the folder, so nothing may be placed in it
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
