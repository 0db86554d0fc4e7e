//! Storage Module
//!
//! Sector slots on disk and the in-memory state that tracks them.
//!
//! ## Responsibilities
//! - Fixed-slot data files, one per storage folder
//! - Folder usage bitmaps and slot selection for new sectors
//! - Sector roots, salted storage ids and refcounted index rows
//! - The manager-wide lock and per-sector locks
//!
//! ## Data File Layout
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────┐
//! │   Slot 0     │   Slot 1     │   Slot 2     │ ... │
//! │ sector_size  │ sector_size  │ sector_size  │     │
//! └──────────────┴──────────────┴──────────────┴─────┘
//!   offset(i) = i * sector_size
//! ```
//!
//! Bit `i` of the folder bitmap is set when slot `i` holds a sector.

mod data_file;
mod folder;
mod folder_table;
mod locks;
mod manager;
mod sector;

pub use data_file::DataFile;
pub use folder::{FolderRecord, FolderState, FolderStatus, StorageFolder, DATA_FILE_NAME};
pub use folder_table::{FolderHandle, FolderTable};
pub use locks::{SectorLockGuard, SectorLocks};
pub use manager::{FolderUsage, ReconcileReport, ResourceLock, SlotChange, StorageManager};
pub use sector::{FolderId, Sector, SectorId, SectorLocation, SectorRoot};
