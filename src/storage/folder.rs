//! Storage folders
//!
//! A folder is a fixed number of sector slots backed by one data file, with
//! a bitmap telling which slots hold a sector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

use super::{DataFile, FolderId};

/// Name of the data file inside every folder directory
pub const DATA_FILE_NAME: &str = "sectors.dat";

/// Whether new sectors may be placed in a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderStatus {
    Available,
    /// Held by a structural update (shrink, expand, removal) or waiting
    /// for recovery to finish one
    Unavailable,
}

/// Index row of a storage folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: FolderId,
    pub path: PathBuf,
    pub num_sectors: u64,
    pub usage: Vec<u64>,
}

/// Capacity and bitmap of a folder, as captured before a structural update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderState {
    pub num_sectors: u64,
    pub usage: Vec<u64>,
    pub status: FolderStatus,
}

/// In-memory folder
pub struct StorageFolder {
    pub id: FolderId,
    pub path: PathBuf,
    pub num_sectors: u64,

    /// Bit `i` set means slot `i` is used
    usage: Vec<u64>,

    /// Number of set bits in `usage`
    stored_sectors: u64,

    pub status: FolderStatus,
    pub data_file: Arc<DataFile>,
}

fn words_for(num_sectors: u64) -> usize {
    num_sectors.div_ceil(64) as usize
}

impl FolderRecord {
    /// Row of a folder with every slot free
    pub fn empty(id: FolderId, path: PathBuf, num_sectors: u64) -> Self {
        Self {
            id,
            path,
            num_sectors,
            usage: vec![0; words_for(num_sectors)],
        }
    }
}

impl StorageFolder {
    /// A new, empty folder
    pub fn new(id: FolderId, path: PathBuf, num_sectors: u64, data_file: Arc<DataFile>) -> Self {
        Self {
            id,
            path,
            num_sectors,
            usage: vec![0; words_for(num_sectors)],
            stored_sectors: 0,
            status: FolderStatus::Available,
            data_file,
        }
    }

    /// Rebuild a folder from its index row
    pub fn from_record(record: FolderRecord, data_file: Arc<DataFile>) -> Result<Self> {
        if record.usage.len() != words_for(record.num_sectors) {
            return Err(StoreError::Corruption(format!(
                "folder {} bitmap has {} words for {} sectors",
                record.id,
                record.usage.len(),
                record.num_sectors
            )));
        }
        let mut folder = Self {
            id: record.id,
            path: record.path,
            num_sectors: record.num_sectors,
            usage: record.usage,
            stored_sectors: 0,
            status: FolderStatus::Available,
            data_file,
        };
        folder.clear_tail();
        folder.stored_sectors = folder.count_used();
        Ok(folder)
    }

    pub fn to_record(&self) -> FolderRecord {
        FolderRecord {
            id: self.id,
            path: self.path.clone(),
            num_sectors: self.num_sectors,
            usage: self.usage.clone(),
        }
    }

    pub fn data_file_path(path: &Path) -> PathBuf {
        path.join(DATA_FILE_NAME)
    }

    // -------------------------------------------------------------------------
    // Bitmap
    // -------------------------------------------------------------------------

    pub fn stored_sectors(&self) -> u64 {
        self.stored_sectors
    }

    pub fn free_sectors(&self) -> u64 {
        self.num_sectors - self.stored_sectors
    }

    pub fn is_available(&self) -> bool {
        self.status == FolderStatus::Available
    }

    pub fn is_used(&self, index: u64) -> bool {
        index < self.num_sectors && self.usage[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Lowest free slot in the folder
    pub fn free_sector_index(&self) -> Option<u64> {
        self.free_sector_index_below(self.num_sectors)
    }

    /// Lowest free slot with index below `limit`
    pub fn free_sector_index_below(&self, limit: u64) -> Option<u64> {
        let limit = limit.min(self.num_sectors);
        for (word_idx, word) in self.usage.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let index = word_idx as u64 * 64 + (!*word).trailing_zeros() as u64;
            if index >= limit {
                return None;
            }
            return Some(index);
        }
        None
    }

    /// Number of used slots at or beyond `boundary`
    pub fn used_from(&self, boundary: u64) -> u64 {
        (boundary..self.num_sectors)
            .filter(|&i| self.is_used(i))
            .count() as u64
    }

    /// Number of free slots below `boundary`
    pub fn free_below(&self, boundary: u64) -> u64 {
        let boundary = boundary.min(self.num_sectors);
        boundary - (0..boundary).filter(|&i| self.is_used(i)).count() as u64
    }

    pub fn set_used(&mut self, index: u64) -> Result<()> {
        self.check_index(index)?;
        if self.is_used(index) {
            return Err(StoreError::Corruption(format!(
                "slot {} of folder {} is already used",
                index, self.id
            )));
        }
        self.usage[(index / 64) as usize] |= 1 << (index % 64);
        self.stored_sectors += 1;
        Ok(())
    }

    pub fn set_free(&mut self, index: u64) -> Result<()> {
        self.check_index(index)?;
        if !self.is_used(index) {
            return Err(StoreError::Corruption(format!(
                "slot {} of folder {} is already free",
                index, self.id
            )));
        }
        self.usage[(index / 64) as usize] &= !(1 << (index % 64));
        self.stored_sectors -= 1;
        Ok(())
    }

    /// Change the capacity; shrinking requires every dropped slot to be free
    pub fn resize(&mut self, num_sectors: u64) -> Result<()> {
        if num_sectors < self.num_sectors {
            let still_used = self.used_from(num_sectors);
            if still_used > 0 {
                return Err(StoreError::Corruption(format!(
                    "folder {} still has {} used slots at or beyond {}",
                    self.id, still_used, num_sectors
                )));
            }
        }
        self.usage.resize(words_for(num_sectors), 0);
        self.num_sectors = num_sectors;
        self.clear_tail();
        Ok(())
    }

    pub fn state(&self) -> FolderState {
        FolderState {
            num_sectors: self.num_sectors,
            usage: self.usage.clone(),
            status: self.status,
        }
    }

    pub fn restore(&mut self, state: FolderState) {
        self.num_sectors = state.num_sectors;
        self.usage = state.usage;
        self.status = state.status;
        self.stored_sectors = self.count_used();
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.num_sectors {
            return Err(StoreError::Corruption(format!(
                "slot {} out of range for folder {} with {} sectors",
                index, self.id, self.num_sectors
            )));
        }
        Ok(())
    }

    fn count_used(&self) -> u64 {
        self.usage.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Zero bits past `num_sectors` in the last word
    fn clear_tail(&mut self) {
        let rem = self.num_sectors % 64;
        if rem != 0 {
            if let Some(last) = self.usage.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}
