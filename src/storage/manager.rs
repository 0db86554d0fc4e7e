//! Storage Manager
//!
//! Owns every shared resource of the engine and hands them to updates.
//!
//! ## Responsibilities
//! - Load folders, the host salt and the WAL on startup
//! - Two lock tiers: the manager-wide RwLock and per-sector locks
//! - Apply index batches together with the folder bitmaps they depend on
//! - Serve reads and usage statistics
//! - Reconcile folder bitmaps against sector rows after recovery

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::index::{IndexBatch, IndexDb};
use crate::wal::{Transaction, Wal};

use super::{
    DataFile, FolderId, FolderStatus, FolderTable, Sector, SectorId, SectorLockGuard, SectorLocks,
    SectorRoot, StorageFolder,
};

/// Locks held by an update from `lock_resource` until after `release`
///
/// Field order is drop order: sector locks go before the manager lock.
pub enum ResourceLock<'m> {
    Shared {
        _sectors: SectorLockGuard<'m>,
        _manager: RwLockReadGuard<'m, ()>,
    },
    Exclusive(RwLockWriteGuard<'m, ()>),
}

/// A bitmap bit to set or clear when an index batch is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    pub folder_id: FolderId,
    pub index: u64,
    pub used: bool,
}

/// Capacity and usage of one folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderUsage {
    pub id: FolderId,
    pub path: PathBuf,
    /// Number of sector slots
    pub capacity: u64,
    /// Number of slots holding a sector
    pub used: u64,
    pub status: FolderStatus,
}

/// Repairs made by [`StorageManager::reconcile`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Bits set with no sector behind them, now freed
    pub leaked_slots: u64,
    /// Sectors whose bit was clear, now set
    pub restored_slots: u64,
    /// Membership rows with no matching sector row, now dropped
    pub dangling_members: u64,
    /// Sector rows pointing outside their folder
    pub out_of_range: u64,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Manages the storage layer
///
/// ## Concurrency:
/// - `lock`: exclusive for updates that change folder layout, shared for
///   everything else
/// - `sector_locks`: at most one in-flight mutation per sector id
/// - `folders`: one mutex per folder, locked briefly and in id order
pub struct StorageManager {
    config: Config,

    /// Manager-wide lock; guards folder layout
    lock: RwLock<()>,

    folders: FolderTable,

    sector_locks: SectorLocks,

    db: IndexDb,

    wal: Wal,

    /// Per-host salt mixed into every sector id
    salt: [u8; 32],

    /// Updates that failed after commit; what they touched is off limits
    /// until the recovery scan on the next open resolves them
    awaiting_recovery: Mutex<AwaitingRecovery>,
}

#[derive(Debug, Default)]
struct AwaitingRecovery {
    sectors: HashSet<SectorId>,
    updates: usize,
}

impl StorageManager {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    pub const WAL_FILENAME: &'static str = "wal.log";
    pub const INDEX_DIR: &'static str = "index";

    /// Open the manager, returning the WAL transactions left unreleased
    ///
    /// On startup:
    /// 1. Create the data directory
    /// 2. Open the index, load the salt and check the sector size
    /// 3. Load every folder and open its data file
    /// 4. Open the WAL and collect unreleased transactions
    pub fn open(config: Config) -> Result<(Self, Vec<Transaction>)> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let db = IndexDb::open(&config.data_dir.join(Self::INDEX_DIR))?;
        db.check_sector_size(config.sector_size)?;
        let salt = db.load_or_create_salt()?;

        let folders = FolderTable::new();
        for record in db.folder_records()? {
            let file_path = StorageFolder::data_file_path(&record.path);
            let data_file = DataFile::open(&file_path, config.sector_size).map_err(|e| {
                error!(folder = record.id, path = %file_path.display(), error = %e, "cannot open data file");
                e
            })?;
            let folder = StorageFolder::from_record(record, Arc::new(data_file))?;
            debug!(
                folder = folder.id,
                path = %folder.path.display(),
                num_sectors = folder.num_sectors,
                stored = folder.stored_sectors(),
                "loaded storage folder"
            );
            folders.insert(folder);
        }

        let (wal, pending) = Wal::open(
            &config.data_dir.join(Self::WAL_FILENAME),
            config.wal_sync_strategy,
        )?;

        info!(
            data_dir = %config.data_dir.display(),
            folders = folders.len(),
            pending_transactions = pending.len(),
            "storage manager opened"
        );

        Ok((
            Self {
                config,
                lock: RwLock::new(()),
                folders,
                sector_locks: SectorLocks::new(),
                db,
                wal,
                salt,
                awaiting_recovery: Mutex::new(AwaitingRecovery::default()),
            },
            pending,
        ))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sector_size(&self) -> u64 {
        self.config.sector_size
    }

    pub fn db(&self) -> &IndexDb {
        &self.db
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn folders(&self) -> &FolderTable {
        &self.folders
    }

    /// Storage key for a content root
    pub fn sector_id(&self, root: &SectorRoot) -> SectorId {
        SectorId::derive(&self.salt, root)
    }

    /// Fire a fault-injection point
    pub fn disrupt(&self, point: &'static str) -> Result<()> {
        self.config.disrupter.check(point)
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Shared manager lock plus the sector locks of `ids`
    pub fn lock_sectors<I>(&self, ids: I) -> ResourceLock<'_>
    where
        I: IntoIterator<Item = SectorId>,
    {
        let manager = self.lock.read();
        let sectors = self.sector_locks.lock(ids);
        ResourceLock::Shared {
            _sectors: sectors,
            _manager: manager,
        }
    }

    /// Exclusive manager lock
    pub fn lock_exclusive(&self) -> ResourceLock<'_> {
        ResourceLock::Exclusive(self.lock.write())
    }

    pub fn sector_locks(&self) -> &SectorLocks {
        &self.sector_locks
    }

    /// Record one update left to recovery, fencing off the sectors it
    /// touched
    pub(crate) fn mark_awaiting_recovery<I>(&self, ids: I)
    where
        I: IntoIterator<Item = SectorId>,
    {
        let mut awaiting = self.awaiting_recovery.lock();
        awaiting.sectors.extend(ids);
        awaiting.updates += 1;
    }

    /// Record one update left to recovery that touched folders, not
    /// individual sectors
    pub(crate) fn mark_layout_awaiting_recovery(&self) {
        self.mark_awaiting_recovery(iter::empty::<SectorId>());
    }

    /// Number of updates left to the next recovery scan
    pub fn updates_awaiting_recovery(&self) -> usize {
        self.awaiting_recovery.lock().updates
    }

    /// Refuse to touch sectors whose last update is waiting on recovery
    pub(crate) fn check_not_awaiting_recovery<'a, I>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a SectorId>,
    {
        let awaiting = self.awaiting_recovery.lock();
        if awaiting.sectors.is_empty() {
            return Ok(());
        }
        for id in ids {
            if awaiting.sectors.contains(id) {
                return Err(StoreError::ResourceBusy(format!(
                    "sector {} is waiting for recovery",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Refuse updates that move sectors or drop slots while any update is
    /// waiting on recovery
    ///
    /// A pending update has reserved slots and logged sector locations that
    /// recovery replays; relocating or dropping them would leave it
    /// unrecoverable.
    pub(crate) fn check_layout_settled(&self) -> Result<()> {
        match self.awaiting_recovery.lock().updates {
            0 => Ok(()),
            n => Err(StoreError::ResourceBusy(format!(
                "{} update(s) waiting for recovery; folders cannot shrink or be removed until reopen",
                n
            ))),
        }
    }

    /// Slot count of an available folder, read after any running layout
    /// update has released the manager lock
    pub fn settled_num_sectors(&self, path: &Path) -> Result<u64> {
        let _guard = self.lock.read();
        let handle = self
            .folders
            .get_by_path(path)
            .ok_or_else(|| StoreError::FolderNotFound(path.to_path_buf()))?;
        let folder = handle.lock();
        if !folder.is_available() {
            return Err(StoreError::ResourceBusy(format!(
                "folder {} is in the middle of another update",
                path.display()
            )));
        }
        Ok(folder.num_sectors)
    }

    // =========================================================================
    // Batch Writes
    // =========================================================================

    /// Apply slot changes and write an index batch as one step
    ///
    /// Every folder in `touched` or named by a change is locked in id order,
    /// the changes are applied to its bitmap, the resulting folder rows are
    /// added to the batch, and the batch is written. Taking the folder rows
    /// while the folders are locked keeps concurrent updates to the same
    /// folder from overwriting each other's bits. If the write fails the
    /// bitmap changes are undone.
    pub fn write_batch(
        &self,
        mut batch: IndexBatch,
        touched: &BTreeSet<FolderId>,
        changes: &[SlotChange],
    ) -> Result<()> {
        let mut ids = touched.clone();
        ids.extend(changes.iter().map(|c| c.folder_id));

        let handles = ids
            .iter()
            .map(|id| self.folders.require(*id))
            .collect::<Result<Vec<_>>>()?;
        let mut guards: BTreeMap<FolderId, MutexGuard<'_, StorageFolder>> = handles
            .iter()
            .map(|h| {
                let guard = h.lock();
                (guard.id, guard)
            })
            .collect();

        let mut flipped = Vec::new();
        let result = (|| -> Result<()> {
            for change in changes {
                let folder = guards.get_mut(&change.folder_id).ok_or_else(|| {
                    StoreError::Corruption(format!("folder {} not locked", change.folder_id))
                })?;
                if folder.is_used(change.index) == change.used {
                    continue;
                }
                if change.used {
                    folder.set_used(change.index)?;
                } else {
                    folder.set_free(change.index)?;
                }
                flipped.push(*change);
            }
            for folder in guards.values() {
                batch.save_folder(&folder.to_record())?;
            }
            self.db.write_batch(batch)
        })();

        if result.is_err() {
            for change in flipped.iter().rev() {
                if let Some(folder) = guards.get_mut(&change.folder_id) {
                    let undo = if change.used {
                        folder.set_free(change.index)
                    } else {
                        folder.set_used(change.index)
                    };
                    if let Err(e) = undo {
                        error!(folder = change.folder_id, index = change.index, error = %e, "cannot undo slot change");
                    }
                }
            }
        }
        result
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current index row of a sector
    pub fn sector(&self, root: &SectorRoot) -> Result<Option<Sector>> {
        self.db.get_sector(&self.sector_id(root))
    }

    /// Read a sector's bytes, checking them against the root
    pub fn read_sector(&self, root: &SectorRoot) -> Result<Bytes> {
        let id = self.sector_id(root);
        let _lock = self.lock_sectors(iter::once(id));

        let sector = self
            .db
            .get_sector(&id)?
            .ok_or_else(|| StoreError::SectorNotFound(root.to_hex()))?;
        let data_file = Arc::clone(&self.folders.require(sector.folder_id)?.lock().data_file);
        let data = data_file.read_sector(sector.index)?;

        if SectorRoot::from_content(&data) != *root {
            error!(
                root = %root,
                folder = sector.folder_id,
                index = sector.index,
                "sector content does not match its root"
            );
            return Err(StoreError::Corruption(format!(
                "sector {} content mismatch at folder {} slot {}",
                root, sector.folder_id, sector.index
            )));
        }
        Ok(Bytes::from(data))
    }

    /// Capacity and usage of every folder, ordered by id
    pub fn folder_usage(&self) -> Vec<FolderUsage> {
        let _guard = self.lock.read();
        self.folders
            .all()
            .iter()
            .map(|f| {
                let folder = f.lock();
                FolderUsage {
                    id: folder.id,
                    path: folder.path.clone(),
                    capacity: folder.num_sectors,
                    used: folder.stored_sectors(),
                    status: folder.status,
                }
            })
            .collect()
    }

    /// Id of the folder at `path`, if loaded
    pub fn folder_id_by_path(&self, path: &Path) -> Option<FolderId> {
        self.folders.get_by_path(path).map(|f| f.lock().id)
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Bring folder bitmaps in line with the sector rows
    ///
    /// Runs once after recovery. Folders still unavailable belong to a
    /// transaction recovery could not resolve and are left alone.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lock.write();
        let mut report = ReconcileReport::default();
        let mut batch = self.db.new_batch();

        for handle in self.folders.all() {
            let mut folder = handle.lock();
            if !folder.is_available() {
                warn!(folder = folder.id, "skipping reconcile of unavailable folder");
                continue;
            }

            let mut expected = HashSet::new();
            for id in self.db.sector_ids_in_folder(folder.id)? {
                match self.db.get_sector(&id)? {
                    Some(sector) if sector.folder_id == folder.id => {
                        if sector.index >= folder.num_sectors {
                            error!(
                                sector = %id,
                                folder = folder.id,
                                index = sector.index,
                                "sector row points past the end of its folder"
                            );
                            report.out_of_range += 1;
                            continue;
                        }
                        expected.insert(sector.index);
                    }
                    _ => {
                        warn!(sector = %id, folder = folder.id, "dropping dangling membership row");
                        batch.unlink_sector(folder.id, &id);
                        report.dangling_members += 1;
                    }
                }
            }

            let mut changed = false;
            for index in 0..folder.num_sectors {
                let used = folder.is_used(index);
                let wanted = expected.contains(&index);
                if used && !wanted {
                    folder.set_free(index)?;
                    report.leaked_slots += 1;
                    changed = true;
                } else if !used && wanted {
                    error!(folder = folder.id, index, "used slot was marked free");
                    folder.set_used(index)?;
                    report.restored_slots += 1;
                    changed = true;
                }
            }
            if changed {
                batch.save_folder(&folder.to_record())?;
            }
        }

        if !batch.is_empty() {
            self.db.write_batch(batch)?;
        }
        if !report.is_clean() {
            warn!(?report, "folder bitmaps reconciled");
        }
        Ok(report)
    }

    /// Flush the index and sync the WAL
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        self.wal.sync()
    }
}
