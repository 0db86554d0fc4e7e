//! In-memory table of storage folders
//!
//! Each folder sits behind its own mutex so sector-level updates running
//! concurrently under the shared manager lock can flip bits in different
//! folders without contending. Structural updates hold the exclusive
//! manager lock and may lock several folders at once.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StoreError};

use super::folder::FolderState;
use super::{FolderId, StorageFolder};

pub type FolderHandle = Arc<Mutex<StorageFolder>>;

#[derive(Default)]
pub struct FolderTable {
    folders: RwLock<BTreeMap<FolderId, FolderHandle>>,
}

impl FolderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, folder: StorageFolder) -> FolderHandle {
        let id = folder.id;
        let handle = Arc::new(Mutex::new(folder));
        self.folders.write().insert(id, Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, id: FolderId) -> Option<FolderHandle> {
        self.folders.write().remove(&id)
    }

    pub fn get(&self, id: FolderId) -> Option<FolderHandle> {
        self.folders.read().get(&id).cloned()
    }

    /// Like `get`, but a missing folder is corruption
    pub fn require(&self, id: FolderId) -> Result<FolderHandle> {
        self.get(id)
            .ok_or_else(|| StoreError::Corruption(format!("folder {} is not loaded", id)))
    }

    pub fn get_by_path(&self, path: &Path) -> Option<FolderHandle> {
        self.folders
            .read()
            .values()
            .find(|f| f.lock().path == path)
            .cloned()
    }

    /// All folders, ordered by id
    pub fn all(&self) -> Vec<FolderHandle> {
        self.folders.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.folders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.read().is_empty()
    }

    /// Lowest id not taken by any folder, starting at 1
    pub fn next_folder_id(&self) -> Result<FolderId> {
        let folders = self.folders.read();
        (1..=FolderId::MAX)
            .find(|id| !folders.contains_key(id))
            .ok_or_else(|| StoreError::InvalidInput("folder ids exhausted".to_string()))
    }

    /// Free slots across available folders, excluding `exclude`
    pub fn free_capacity(&self, exclude: FolderId) -> u64 {
        self.all()
            .iter()
            .map(|f| f.lock())
            .filter(|f| f.id != exclude && f.is_available())
            .map(|f| f.free_sectors())
            .sum()
    }

    /// Pick a folder for a new sector and reserve a slot in it
    ///
    /// Policy: among available folders other than `exclude`, the one with
    /// the most free slots wins; ties go to the lowest folder id. Within
    /// the folder the lowest free slot is taken. If the chosen folder fills
    /// up between ranking and reservation the next candidate is tried.
    pub fn reserve_slot(&self, exclude: Option<FolderId>) -> Result<(FolderId, u64)> {
        let mut ranked: Vec<(u64, FolderId, FolderHandle)> = self
            .all()
            .into_iter()
            .filter_map(|handle| {
                let folder = handle.lock();
                if Some(folder.id) == exclude || !folder.is_available() || folder.free_sectors() == 0 {
                    return None;
                }
                let key = (folder.free_sectors(), folder.id);
                drop(folder);
                Some((key.0, key.1, handle))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, id, handle) in ranked {
            let mut folder = handle.lock();
            if !folder.is_available() {
                continue;
            }
            if let Some(index) = folder.free_sector_index() {
                folder.set_used(index)?;
                return Ok((id, index));
            }
        }
        Err(StoreError::Full)
    }

    /// Capture every folder's capacity, bitmap and status
    pub fn snapshot(&self) -> Vec<(FolderId, FolderState)> {
        self.all()
            .iter()
            .map(|f| {
                let folder = f.lock();
                (folder.id, folder.state())
            })
            .collect()
    }

    /// Put folders back to a snapshot taken with [`snapshot`](Self::snapshot)
    pub fn restore(&self, snapshot: Vec<(FolderId, FolderState)>) {
        for (id, state) in snapshot {
            if let Some(handle) = self.get(id) {
                handle.lock().restore(state);
            }
        }
    }
}
