//! Sector relocation
//!
//! Moving sectors out of a slot range is shared by folder shrinking and
//! folder removal. Each move is logged as a [`Relocation`] so recovery can
//! finish it without re-deciding where sectors go.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::index::IndexBatch;
use crate::storage::{
    DataFile, FolderId, Sector, SectorId, SectorLocation, SectorRoot, StorageManager,
};
use crate::wal::{OpName, Operation};

/// One logged sector move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Relocation {
    pub id: SectorId,
    pub from: SectorLocation,
    pub to: SectorLocation,
}

impl Relocation {
    pub fn to_operation(&self) -> Result<Operation> {
        Operation::encode(OpName::RelocateSector, self)
    }
}

/// Choose a new slot for every sector of `source` at or beyond `boundary`
///
/// A free slot below the boundary in the same folder is preferred; after
/// that the folder selection policy picks another folder. Target slots are
/// marked used and source slots freed in memory. Moves are ordered by
/// source index.
pub(crate) fn plan(
    manager: &StorageManager,
    source: FolderId,
    boundary: u64,
) -> Result<Vec<Relocation>> {
    let handle = manager.folders().require(source)?;

    let mut moving = Vec::new();
    for id in manager.db().sector_ids_in_folder(source)? {
        let sector = manager.db().get_sector(&id)?.ok_or_else(|| {
            StoreError::Corruption(format!(
                "folder {} lists sector {} with no sector row",
                source, id
            ))
        })?;
        if sector.folder_id != source {
            return Err(StoreError::Corruption(format!(
                "sector {} is listed in folder {} but stored in folder {}",
                id, source, sector.folder_id
            )));
        }
        if sector.index >= boundary {
            moving.push(sector);
        }
    }
    moving.sort_by_key(|s| s.index);

    let mut moves = Vec::with_capacity(moving.len());
    for sector in moving {
        let same_folder = {
            let mut folder = handle.lock();
            match folder.free_sector_index_below(boundary) {
                Some(index) => {
                    folder.set_used(index)?;
                    Some(index)
                }
                None => None,
            }
        };
        let (folder_id, index) = match same_folder {
            Some(index) => (source, index),
            None => manager.folders().reserve_slot(Some(source))?,
        };
        handle.lock().set_free(sector.index)?;

        moves.push(Relocation {
            id: sector.id,
            from: sector.location(),
            to: SectorLocation {
                folder_id,
                index,
                count: sector.count,
            },
        });
    }

    debug!(folder = source, boundary, moves = moves.len(), "relocation planned");
    Ok(moves)
}

/// Stage index rows for freshly planned moves
pub(crate) fn stage(batch: &mut IndexBatch, moves: &[Relocation]) -> Result<()> {
    for m in moves {
        batch.unlink_sector(m.from.folder_id, &m.id);
        batch.save_sector(&Sector::at(m.id, m.to))?;
    }
    Ok(())
}

/// Re-stage logged moves against what is on disk now
///
/// Returns the moves whose bytes still have to be copied. A sector already
/// at its target is left alone; one deleted since is skipped. Folder bits
/// are brought to the post-move state either way.
pub(crate) fn restage(
    manager: &StorageManager,
    batch: &mut IndexBatch,
    moves: &[Relocation],
) -> Result<Vec<Relocation>> {
    let mut pending = Vec::new();

    for m in moves {
        let Some(sector) = manager.db().get_sector(&m.id)? else {
            debug!(sector = %m.id, "relocated sector was deleted since");
            set_slot(manager, m.from, false)?;
            continue;
        };

        let at = (sector.folder_id, sector.index);
        if at == (m.from.folder_id, m.from.index) {
            let to = SectorLocation {
                count: sector.count,
                ..m.to
            };
            batch.unlink_sector(m.from.folder_id, &m.id);
            batch.save_sector(&Sector::at(m.id, to))?;
            pending.push(Relocation {
                id: m.id,
                from: sector.location(),
                to,
            });
        } else if at != (m.to.folder_id, m.to.index) {
            return Err(StoreError::Corruption(format!(
                "sector {} found in folder {} slot {}, expected slot {} of folder {} or {} of folder {}",
                m.id, at.0, at.1, m.from.index, m.from.folder_id, m.to.index, m.to.folder_id
            )));
        }

        set_slot(manager, m.to, true)?;
        set_slot(manager, m.from, false)?;
    }

    Ok(pending)
}

/// Force one folder bit; a folder or slot that no longer exists is ignored
fn set_slot(manager: &StorageManager, at: SectorLocation, used: bool) -> Result<()> {
    let Some(handle) = manager.folders().get(at.folder_id) else {
        return Ok(());
    };
    let mut folder = handle.lock();
    if at.index >= folder.num_sectors || folder.is_used(at.index) == used {
        return Ok(());
    }
    if used {
        folder.set_used(at.index)
    } else {
        folder.set_free(at.index)
    }
}

/// Copy the bytes of every move, checking each against its sector id
pub(crate) fn copy(manager: &StorageManager, moves: &[Relocation]) -> Result<()> {
    for m in moves {
        let source = data_file(manager, m.from.folder_id)?;
        let target = data_file(manager, m.to.folder_id)?;

        let data = source.read_sector(m.from.index)?;
        if manager.sector_id(&SectorRoot::from_content(&data)) != m.id {
            return Err(StoreError::Corruption(format!(
                "slot {} of folder {} does not hold sector {}",
                m.from.index, m.from.folder_id, m.id
            )));
        }
        target.write_sector(m.to.index, &data)?;
    }
    Ok(())
}

/// Folders receiving sectors
pub(crate) fn targets(moves: &[Relocation]) -> BTreeSet<FolderId> {
    moves.iter().map(|m| m.to.folder_id).collect()
}

fn data_file(manager: &StorageManager, folder_id: FolderId) -> Result<Arc<DataFile>> {
    Ok(Arc::clone(&manager.folders().require(folder_id)?.lock().data_file))
}
