//! Write-sector update
//!
//! Stores new content in a free slot, or adds a virtual reference when the
//! content is already stored. A committed write the caller never saw finish
//! is reverted by recovery.

use std::collections::BTreeSet;
use std::fmt;
use std::iter;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::index::IndexBatch;
use crate::storage::{
    FolderId, ResourceLock, Sector, SectorId, SectorRoot, SlotChange, StorageManager,
};
use crate::wal::{OpName, Operation, Transaction};

use super::{decode_intent, decode_ops, open_txn, settle, Outcome, Resolution, Target, Update};

#[derive(Debug, Serialize, Deserialize)]
struct AddSectorIntent {
    id: SectorId,
}

/// Where the sector lands and how its count changes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Placement {
    folder_id: FolderId,
    index: u64,
    prev_count: u64,
    new_count: u64,
}

impl Placement {
    fn is_physical(&self) -> bool {
        self.prev_count == 0
    }
}

pub struct AddSectorUpdate {
    id: SectorId,
    root: Option<SectorRoot>,
    /// `None` when rebuilt by recovery
    data: Option<Bytes>,

    placement: Option<Placement>,
    /// Slot taken by `reserve_slot` and not yet written
    reserved: Option<(FolderId, u64)>,
    batch: Option<IndexBatch>,
    changes: Vec<SlotChange>,
    txn: Option<Transaction>,
}

impl AddSectorUpdate {
    pub fn new(manager: &StorageManager, data: Bytes) -> Self {
        let root = SectorRoot::from_content(&data);
        Self {
            id: manager.sector_id(&root),
            root: Some(root),
            data: Some(data),
            placement: None,
            reserved: None,
            batch: None,
            changes: Vec::new(),
            txn: None,
        }
    }

    pub(crate) fn from_transaction(txn: Transaction) -> Result<Self> {
        let intent: AddSectorIntent = decode_intent(&txn, OpName::AddSector)?;
        let placement = decode_ops::<Placement>(&txn, OpName::PlaceSector)?
            .into_iter()
            .next();
        Ok(Self {
            id: intent.id,
            root: None,
            data: None,
            placement,
            reserved: None,
            batch: None,
            changes: Vec::new(),
            txn: Some(txn),
        })
    }

    pub fn root(&self) -> Option<SectorRoot> {
        self.root
    }

    /// Stage the placement of new content or one more reference
    fn prepare_normal(&mut self, manager: &StorageManager) -> Result<()> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| StoreError::InvalidInput("no sector data to write".to_string()))?;
        if data.len() as u64 != manager.sector_size() {
            return Err(StoreError::InvalidInput(format!(
                "sector is {} bytes, expected {}",
                data.len(),
                manager.sector_size()
            )));
        }

        let placement = match manager.db().get_sector(&self.id)? {
            Some(existing) => Placement {
                folder_id: existing.folder_id,
                index: existing.index,
                prev_count: existing.count,
                new_count: existing.count.checked_add(1).ok_or_else(|| {
                    StoreError::InvalidInput(format!("sector {} reference count overflow", self.id))
                })?,
            },
            None => {
                let (folder_id, index) = manager.folders().reserve_slot(None)?;
                self.reserved = Some((folder_id, index));
                Placement {
                    folder_id,
                    index,
                    prev_count: 0,
                    new_count: 1,
                }
            }
        };

        open_txn(&mut self.txn)?.append(vec![Operation::encode(OpName::PlaceSector, &placement)?])?;

        let mut batch = manager.db().new_batch();
        batch.save_sector(&Sector {
            id: self.id,
            folder_id: placement.folder_id,
            index: placement.index,
            count: placement.new_count,
        })?;
        if placement.is_physical() {
            self.changes.push(SlotChange {
                folder_id: placement.folder_id,
                index: placement.index,
                used: true,
            });
        }
        self.batch = Some(batch);
        self.placement = Some(placement);
        Ok(())
    }

    /// Stage the state from before the write
    fn prepare_revert(&mut self, manager: &StorageManager) -> Result<()> {
        let placement = self.placement.ok_or_else(|| {
            StoreError::Corruption(format!("committed write of {} has no placement", self.id))
        })?;

        let mut batch = manager.db().new_batch();
        let current = manager.db().get_sector(&self.id)?;
        if let Some(current) = current {
            if (current.folder_id, current.index) != (placement.folder_id, placement.index) {
                return Err(StoreError::Corruption(format!(
                    "sector {} is in folder {} slot {}, write placed it in folder {} slot {}",
                    self.id, current.folder_id, current.index, placement.folder_id, placement.index
                )));
            }
        }

        if placement.is_physical() {
            if let Some(current) = current {
                batch.delete_sector(&current);
            }
            self.changes.push(SlotChange {
                folder_id: placement.folder_id,
                index: placement.index,
                used: false,
            });
        } else {
            batch.save_sector(&Sector {
                id: self.id,
                folder_id: placement.folder_id,
                index: placement.index,
                count: placement.prev_count,
            })?;
        }
        self.batch = Some(batch);
        Ok(())
    }
}

impl fmt::Display for AddSectorUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            Some(root) => write!(f, "write sector {}", root),
            None => write!(f, "write sector id {}", self.id),
        }
    }
}

impl Update for AddSectorUpdate {
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m> {
        manager.lock_sectors(iter::once(self.id))
    }

    fn record_intent(&mut self, manager: &StorageManager) -> Result<()> {
        manager.check_not_awaiting_recovery(iter::once(&self.id))?;
        let intent = Operation::encode(OpName::AddSector, &AddSectorIntent { id: self.id })?;
        self.txn = Some(manager.wal().new_transaction(vec![intent])?);
        Ok(())
    }

    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()> {
        match target {
            Target::Normal => self.prepare_normal(manager),
            Target::RecoverCommitted => self.prepare_revert(manager),
        }
    }

    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| StoreError::Corruption("write sector has no staged batch".to_string()))?;

        if target == Target::RecoverCommitted {
            manager.write_batch(batch, &BTreeSet::new(), &self.changes)?;
            return Ok(Resolution::Reverted);
        }

        open_txn(&mut self.txn)?.commit()?;
        manager.disrupt("add_sector/after_commit")?;

        if let (Some(placement), Some(data)) = (self.placement, self.data.as_ref()) {
            if placement.is_physical() {
                let data_file = Arc::clone(
                    &manager.folders().require(placement.folder_id)?.lock().data_file,
                );
                data_file.write_sector(placement.index, data)?;
            }
        }
        manager.disrupt("add_sector/after_write")?;

        manager.write_batch(batch, &BTreeSet::new(), &self.changes)?;
        self.reserved = None;
        Ok(Resolution::Finished)
    }

    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()> {
        let mut undo = Ok(());
        // a committed write keeps its reserved slot until recovery reverts it
        if outcome.is_failure() && !self.is_committed() {
            if let Some((folder_id, index)) = self.reserved.take() {
                if let Some(handle) = manager.folders().get(folder_id) {
                    undo = handle.lock().set_free(index);
                }
            }
        }
        settle(manager, self.txn.take(), &outcome)?;
        undo
    }

    fn defer_to_recovery(&self, manager: &StorageManager) {
        manager.mark_awaiting_recovery(iter::once(self.id));
    }

    fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }
}
