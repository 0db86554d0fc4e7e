//! Delete-sector-batch update
//!
//! Drops one reference per listed root. A sector whose count reaches zero
//! loses its row and its slot; its bytes are left in place. Every root has
//! to resolve to a stored sector or nothing is deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::index::IndexBatch;
use crate::storage::{
    FolderId, ResourceLock, Sector, SectorId, SectorRoot, SlotChange, StorageManager,
};
use crate::wal::{OpName, Operation, Transaction};

use super::{decode_intent, decode_ops, open_txn, settle, Outcome, Resolution, Target, Update};

#[derive(Debug, Serialize, Deserialize)]
struct DeleteBatchIntent {
    ids: Vec<SectorId>,
}

/// Logged count change of one sector
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SectorDelete {
    id: SectorId,
    folder_id: FolderId,
    index: u64,
    prev_count: u64,
    new_count: u64,
}

pub struct DeleteBatchUpdate {
    /// Caller's roots, parallel to `ids`; empty when rebuilt by recovery
    roots: Vec<SectorRoot>,
    ids: Vec<SectorId>,

    deletes: Vec<SectorDelete>,
    batch: Option<IndexBatch>,
    changes: Vec<SlotChange>,
    txn: Option<Transaction>,
}

impl DeleteBatchUpdate {
    pub fn new(manager: &StorageManager, roots: &[SectorRoot]) -> Self {
        Self {
            roots: roots.to_vec(),
            ids: roots.iter().map(|r| manager.sector_id(r)).collect(),
            deletes: Vec::new(),
            batch: None,
            changes: Vec::new(),
            txn: None,
        }
    }

    pub(crate) fn from_transaction(txn: Transaction) -> Result<Self> {
        let intent: DeleteBatchIntent = decode_intent(&txn, OpName::DeleteSectorBatch)?;
        let deletes = decode_ops(&txn, OpName::DeleteSector)?;
        Ok(Self {
            roots: Vec::new(),
            ids: intent.ids,
            deletes,
            batch: None,
            changes: Vec::new(),
            txn: Some(txn),
        })
    }

    /// Name of the `pos`-th entry for error messages
    fn describe(&self, pos: usize) -> String {
        match self.roots.get(pos) {
            Some(root) => root.to_hex(),
            None => self.ids[pos].to_string(),
        }
    }

    fn prepare_normal(&mut self, manager: &StorageManager) -> Result<()> {
        // id -> (occurrences, first position)
        let mut occurrences: BTreeMap<SectorId, (u64, usize)> = BTreeMap::new();
        for (pos, id) in self.ids.iter().enumerate() {
            occurrences.entry(*id).or_insert((0, pos)).0 += 1;
        }

        let mut deletes = Vec::with_capacity(occurrences.len());
        for (id, (times, pos)) in occurrences {
            let sector = manager
                .db()
                .get_sector(&id)?
                .ok_or_else(|| StoreError::SectorNotFound(self.describe(pos)))?;
            if times > sector.count {
                return Err(StoreError::InvalidInput(format!(
                    "sector {} has {} references, batch drops {}",
                    self.describe(pos),
                    sector.count,
                    times
                )));
            }
            if sector.count <= times {
                // the slot is freed; its folder has to exist
                manager.folders().require(sector.folder_id)?;
            }
            deletes.push(SectorDelete {
                id,
                folder_id: sector.folder_id,
                index: sector.index,
                prev_count: sector.count,
                new_count: sector.count - times,
            });
        }

        let ops = deletes
            .iter()
            .map(|d| Operation::encode(OpName::DeleteSector, d))
            .collect::<Result<Vec<_>>>()?;
        open_txn(&mut self.txn)?.append_chunked(ops, manager.config().wal_ops_per_record)?;

        self.deletes = deletes;
        self.stage(manager)
    }

    /// Stage the post-delete state of every sector
    ///
    /// Counts are written as absolute values, so staging the same deletes
    /// twice lands on the same rows.
    fn stage(&mut self, manager: &StorageManager) -> Result<()> {
        let mut batch = manager.db().new_batch();
        self.changes.clear();

        for d in &self.deletes {
            let sector = Sector {
                id: d.id,
                folder_id: d.folder_id,
                index: d.index,
                count: d.new_count,
            };
            if d.new_count == 0 {
                batch.delete_sector(&sector);
                self.changes.push(SlotChange {
                    folder_id: d.folder_id,
                    index: d.index,
                    used: false,
                });
            } else {
                batch.save_sector(&sector)?;
            }
        }
        self.batch = Some(batch);
        Ok(())
    }

    fn check_recoverable(&self, manager: &StorageManager) -> Result<()> {
        for d in &self.deletes {
            if let Some(current) = manager.db().get_sector(&d.id)? {
                if (current.folder_id, current.index) != (d.folder_id, d.index) {
                    return Err(StoreError::Corruption(format!(
                        "sector {} moved to folder {} slot {} during its delete",
                        d.id, current.folder_id, current.index
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for DeleteBatchUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete batch of {} sectors", self.ids.len())
    }
}

impl Update for DeleteBatchUpdate {
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m> {
        manager.lock_sectors(self.ids.iter().copied())
    }

    fn record_intent(&mut self, manager: &StorageManager) -> Result<()> {
        manager.check_not_awaiting_recovery(&self.ids)?;
        let intent = Operation::encode(
            OpName::DeleteSectorBatch,
            &DeleteBatchIntent {
                ids: self.ids.clone(),
            },
        )?;
        self.txn = Some(manager.wal().new_transaction(vec![intent])?);
        Ok(())
    }

    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()> {
        match target {
            Target::Normal => self.prepare_normal(manager),
            Target::RecoverCommitted => {
                self.check_recoverable(manager)?;
                self.stage(manager)
            }
        }
    }

    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| StoreError::Corruption("delete batch has no staged batch".to_string()))?;

        if target == Target::Normal {
            open_txn(&mut self.txn)?.commit()?;
            manager.disrupt("delete_batch/after_commit")?;
        }

        manager.write_batch(batch, &BTreeSet::new(), &self.changes)?;
        debug!(
            sectors = self.deletes.len(),
            freed = self.changes.len(),
            "delete batch applied"
        );

        if target == Target::Normal {
            manager.disrupt("delete_batch/before_release")?;
        }
        Ok(Resolution::Finished)
    }

    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()> {
        settle(manager, self.txn.take(), &outcome)
    }

    fn defer_to_recovery(&self, manager: &StorageManager) {
        manager.mark_awaiting_recovery(self.ids.iter().copied());
    }

    fn transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }
}
