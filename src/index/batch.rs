//! Staged index writes
//!
//! Updates collect every row change here during `prepare` and apply the
//! whole batch atomically in `process`.

use std::path::Path;

use crate::error::Result;
use crate::storage::{FolderId, FolderRecord, Sector, SectorId};

use super::keys;

/// An atomic set of index writes
#[derive(Default)]
pub struct IndexBatch {
    pub(crate) inner: sled::Batch,
    ops: usize,
}

impl IndexBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a sector row and its folder membership
    pub fn save_sector(&mut self, sector: &Sector) -> Result<()> {
        self.inner
            .insert(keys::sector_key(&sector.id), bincode::serialize(sector)?);
        self.inner
            .insert(keys::member_key(sector.folder_id, &sector.id), Vec::new());
        self.ops += 2;
        Ok(())
    }

    /// Drop a sector row and its folder membership
    pub fn delete_sector(&mut self, sector: &Sector) {
        self.inner.remove(keys::sector_key(&sector.id));
        self.unlink_sector(sector.folder_id, &sector.id);
        self.ops += 1;
    }

    /// Drop only the membership of a sector in a folder
    pub fn unlink_sector(&mut self, folder_id: FolderId, id: &SectorId) {
        self.inner.remove(keys::member_key(folder_id, id));
        self.ops += 1;
    }

    /// Store a folder row and its path mapping
    pub fn save_folder(&mut self, record: &FolderRecord) -> Result<()> {
        self.inner
            .insert(keys::folder_key(record.id), bincode::serialize(record)?);
        self.inner.insert(
            keys::folder_path_key(&record.path),
            record.id.to_be_bytes().to_vec(),
        );
        self.ops += 2;
        Ok(())
    }

    /// Drop a folder row and its path mapping
    pub fn delete_folder(&mut self, id: FolderId, path: &Path) {
        self.inner.remove(keys::folder_key(id));
        self.inner.remove(keys::folder_path_key(path));
        self.ops += 2;
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }

    /// Number of staged key writes
    pub fn len(&self) -> usize {
        self.ops
    }
}
