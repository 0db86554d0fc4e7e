//! Engine Module
//!
//! The entry point collaborators call into.
//!
//! ## Responsibilities
//! - Open the storage manager and run startup recovery before serving
//! - Turn each call into an update and drive it through the protocol
//! - Refuse new calls once shutdown starts, and let in-flight ones finish

use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::storage::{FolderUsage, ReconcileReport, SectorLocation, SectorRoot, StorageManager};
use crate::update::{
    self, AddFolderUpdate, AddSectorUpdate, DeleteBatchUpdate, ExpandFolderUpdate,
    RecoveryReport, RemoveFolderUpdate, ShrinkFolderUpdate,
};

/// The sector storage engine
///
/// ## Concurrency Model
///
/// - **Sector operations** (write/delete/read): shared manager lock plus
///   the locks of the sectors involved; disjoint sets run in parallel
/// - **Folder operations** (add/remove/resize): exclusive manager lock
/// - **Lifecycle**: every call registers as in flight; `shutdown` flips a
///   closing flag, then waits for the in-flight count to reach zero
pub struct Engine {
    manager: StorageManager,

    lifecycle: Lifecycle,

    /// What startup recovery did
    recovery: RecoveryReport,

    /// What the reconcile pass after recovery repaired
    reconcile: ReconcileReport,
}

#[derive(Default)]
struct Lifecycle {
    state: Mutex<LifecycleState>,
    idle: Condvar,
}

#[derive(Default)]
struct LifecycleState {
    closing: bool,
    active: usize,
}

/// Marks one call as in flight for as long as it lives
struct InFlight<'a> {
    lifecycle: &'a Lifecycle,
}

impl Lifecycle {
    fn enter(&self) -> Result<InFlight<'_>> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(StoreError::Stopped);
        }
        state.active += 1;
        Ok(InFlight { lifecycle: self })
    }

    /// Stop admitting calls and wait for the running ones
    ///
    /// Returns false if shutdown had already started.
    fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closing {
            return false;
        }
        state.closing = true;
        while state.active > 0 {
            self.idle.wait(&mut state);
        }
        true
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.lifecycle.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.lifecycle.idle.notify_all();
        }
    }
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate the config
    /// 2. Open the storage manager (index, folders, WAL)
    /// 3. Resolve every transaction left in the WAL
    /// 4. Reconcile folder bitmaps with the sector rows, unless a
    ///    transaction could not be resolved
    /// 5. Ready to serve requests
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let (manager, pending) = StorageManager::open(config)?;

        let recovery = update::recover_transactions(&manager, pending);
        if recovery != RecoveryReport::default() {
            info!(
                discarded = recovery.discarded,
                finished = recovery.finished,
                reverted = recovery.reverted,
                failed = recovery.failed,
                "startup recovery complete"
            );
        }

        // Recovery forces the target bits of relocations it could not
        // finish; reconcile would free them
        let reconcile = if recovery.failed == 0 {
            manager.reconcile()?
        } else {
            warn!(
                failed = recovery.failed,
                "skipping bitmap reconcile while transactions remain unresolved"
            );
            ReconcileReport::default()
        };

        Ok(Self {
            manager,
            lifecycle: Lifecycle::default(),
            recovery,
            reconcile,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    // =========================================================================
    // Sector Operations
    // =========================================================================

    /// Store a sector, returning its root
    ///
    /// Writing content that is already stored adds a reference instead of
    /// a second copy.
    pub fn write(&self, data: &[u8]) -> Result<SectorRoot> {
        let _in_flight = self.lifecycle.enter()?;
        if data.len() as u64 != self.manager.sector_size() {
            return Err(StoreError::InvalidInput(format!(
                "sector is {} bytes, expected {}",
                data.len(),
                self.manager.sector_size()
            )));
        }

        let mut update = AddSectorUpdate::new(&self.manager, Bytes::copy_from_slice(data));
        update::execute(&self.manager, &mut update)?;
        let root = SectorRoot::from_content(data);
        debug!(root = %root, "sector written");
        Ok(root)
    }

    /// Read a sector's bytes
    pub fn read(&self, root: &SectorRoot) -> Result<Bytes> {
        let _in_flight = self.lifecycle.enter()?;
        self.manager.read_sector(root)
    }

    /// Drop one reference to a sector
    pub fn delete(&self, root: &SectorRoot) -> Result<()> {
        self.delete_batch(std::slice::from_ref(root))
    }

    /// Drop one reference per listed root, all or nothing
    ///
    /// A root listed twice drops two references.
    pub fn delete_batch(&self, roots: &[SectorRoot]) -> Result<()> {
        let _in_flight = self.lifecycle.enter()?;
        if roots.is_empty() {
            return Ok(());
        }
        let mut update = DeleteBatchUpdate::new(&self.manager, roots);
        update::execute(&self.manager, &mut update)?;
        Ok(())
    }

    // =========================================================================
    // Folder Operations
    // =========================================================================

    /// Add a storage folder holding `size` bytes of sectors
    ///
    /// `size` is rounded down to a whole number of sectors.
    pub fn add_folder(&self, path: impl AsRef<Path>, size: u64) -> Result<()> {
        let _in_flight = self.lifecycle.enter()?;
        let num_sectors = size / self.manager.sector_size();
        let mut update = AddFolderUpdate::new(path.as_ref().to_path_buf(), num_sectors);
        update::execute(&self.manager, &mut update)?;
        Ok(())
    }

    /// Remove a folder, moving its sectors into the others
    pub fn remove_folder(&self, path: impl AsRef<Path>) -> Result<()> {
        let _in_flight = self.lifecycle.enter()?;
        let mut update = RemoveFolderUpdate::new(path.as_ref().to_path_buf());
        update::execute(&self.manager, &mut update)?;
        Ok(())
    }

    /// Grow or shrink a folder to `new_size` bytes of sectors
    pub fn resize_folder(&self, path: impl AsRef<Path>, new_size: u64) -> Result<()> {
        let _in_flight = self.lifecycle.enter()?;
        let path: PathBuf = path.as_ref().to_path_buf();
        let target = new_size / self.manager.sector_size();
        if target == 0 {
            return Err(StoreError::InvalidInput(format!(
                "folder {} cannot be resized below one sector",
                path.display()
            )));
        }

        let current = self.manager.settled_num_sectors(&path)?;

        if target < current {
            update::execute(&self.manager, &mut ShrinkFolderUpdate::new(path, target))?;
        } else if target > current {
            update::execute(&self.manager, &mut ExpandFolderUpdate::new(path, target))?;
        }
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Capacity and usage of every folder
    pub fn folder_usage(&self) -> Result<Vec<FolderUsage>> {
        let _in_flight = self.lifecycle.enter()?;
        Ok(self.manager.folder_usage())
    }

    pub fn sector_exists(&self, root: &SectorRoot) -> Result<bool> {
        Ok(self.sector_count(root)? > 0)
    }

    /// Reference count of a sector; 0 if it is not stored
    pub fn sector_count(&self, root: &SectorRoot) -> Result<u64> {
        let _in_flight = self.lifecycle.enter()?;
        Ok(self.manager.sector(root)?.map_or(0, |s| s.count))
    }

    /// Folder, slot and reference count of a stored sector
    pub fn sector_location(&self, root: &SectorRoot) -> Result<Option<SectorLocation>> {
        let _in_flight = self.lifecycle.enter()?;
        Ok(self.manager.sector(root)?.map(|s| s.location()))
    }

    /// Number of distinct stored sectors
    pub fn distinct_sectors(&self) -> Result<usize> {
        let _in_flight = self.lifecycle.enter()?;
        Ok(self.manager.db().sector_count())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop accepting calls, wait for running ones and flush to disk
    ///
    /// Calls made after this return [`StoreError::Stopped`]. Calling it
    /// twice is harmless.
    pub fn shutdown(&self) -> Result<()> {
        if !self.lifecycle.close() {
            return Ok(());
        }
        self.manager.flush()?;
        info!(data_dir = %self.data_dir().display(), "engine shut down");
        Ok(())
    }

    /// Shut down and release every file handle
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.manager.config().data_dir
    }

    pub fn sector_size(&self) -> u64 {
        self.manager.sector_size()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        self.manager.config()
    }

    /// Outcome of the recovery scan run by `open`
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Repairs made by the reconcile pass run by `open`
    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.reconcile
    }

    /// Number of WAL transactions not yet released
    pub fn open_transactions(&self) -> usize {
        self.manager.wal().open_transactions()
    }

    /// Number of updates fenced off until the next open recovers them
    pub fn updates_awaiting_recovery(&self) -> usize {
        self.manager.updates_awaiting_recovery()
    }
}
