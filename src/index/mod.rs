//! Index Module
//!
//! Embedded key-value index (sled) holding the durable copy of every
//! sector row and folder row.
//!
//! ## Responsibilities
//! - Point lookups of sector rows by storage id
//! - Folder rows, path → id mapping and folder membership scans
//! - The per-host salt and the sector size the index was created with
//! - Atomic, flushed application of an [`IndexBatch`]

mod batch;
mod keys;

use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::storage::{FolderId, FolderRecord, Sector, SectorId};

pub use batch::IndexBatch;

/// Handle to the sled index
pub struct IndexDb {
    db: sled::Db,
    path: PathBuf,
}

impl IndexDb {
    /// Open or create the index at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    // =========================================================================
    // Sectors
    // =========================================================================

    pub fn get_sector(&self, id: &SectorId) -> Result<Option<Sector>> {
        match self.db.get(keys::sector_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of every sector whose membership row points at `folder_id`
    pub fn sector_ids_in_folder(&self, folder_id: FolderId) -> Result<Vec<SectorId>> {
        let mut ids = Vec::new();
        for item in self.db.scan_prefix(keys::member_prefix(folder_id)) {
            let (key, _) = item?;
            let id = keys::sector_id_from_member_key(&key).ok_or_else(|| {
                StoreError::Corruption(format!("malformed membership key {:?}", key))
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn sector_count(&self) -> usize {
        self.db.scan_prefix(keys::SECTOR_PREFIX).count()
    }

    // =========================================================================
    // Folders
    // =========================================================================

    pub fn get_folder(&self, id: FolderId) -> Result<Option<FolderRecord>> {
        match self.db.get(keys::folder_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn folder_id_by_path(&self, path: &Path) -> Result<Option<FolderId>> {
        match self.db.get(keys::folder_path_key(path))? {
            Some(bytes) => {
                let raw = <[u8; 4]>::try_from(&bytes[..]).map_err(|_| {
                    StoreError::Corruption(format!("bad folder id for {}", path.display()))
                })?;
                Ok(Some(FolderId::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Every folder row, ordered by id
    pub fn folder_records(&self) -> Result<Vec<FolderRecord>> {
        let mut records = Vec::new();
        for item in self.db.scan_prefix(keys::FOLDER_PREFIX) {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Load the host salt, generating and persisting one on first open
    pub fn load_or_create_salt(&self) -> Result<[u8; 32]> {
        if let Some(bytes) = self.db.get(keys::SALT_KEY)? {
            return <[u8; 32]>::try_from(&bytes[..])
                .map_err(|_| StoreError::Corruption("salt is not 32 bytes".to_string()));
        }

        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        self.db.insert(keys::SALT_KEY, &salt[..])?;
        self.db.flush()?;
        info!(path = %self.path.display(), "generated new host salt");
        Ok(salt)
    }

    /// Pin the sector size on first open; refuse a different one later
    pub fn check_sector_size(&self, sector_size: u64) -> Result<()> {
        match self.db.get(keys::SECTOR_SIZE_KEY)? {
            Some(bytes) => {
                let raw = <[u8; 8]>::try_from(&bytes[..]).map_err(|_| {
                    StoreError::Corruption("stored sector size is not 8 bytes".to_string())
                })?;
                let stored = u64::from_be_bytes(raw);
                if stored != sector_size {
                    return Err(StoreError::Config(format!(
                        "index was created with sector size {}, config asks for {}",
                        stored, sector_size
                    )));
                }
                Ok(())
            }
            None => {
                self.db
                    .insert(keys::SECTOR_SIZE_KEY, &sector_size.to_be_bytes()[..])?;
                self.db.flush()?;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Batches
    // =========================================================================

    pub fn new_batch(&self) -> IndexBatch {
        IndexBatch::new()
    }

    /// Apply a batch atomically and flush it to disk
    pub fn write_batch(&self, batch: IndexBatch) -> Result<()> {
        self.db.apply_batch(batch.inner)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
