//! Configuration for SectorStore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::disrupt::Disrupter;
use crate::error::{Result, StoreError};

/// Default sector size: 4 MiB
pub const DEFAULT_SECTOR_SIZE: u64 = 1 << 22;

/// Default upper bound on the number of sectors a single folder may hold
pub const DEFAULT_MAX_SECTORS_PER_FOLDER: u64 = 1 << 20;

/// Default number of operations logged in one WAL record
pub const DEFAULT_WAL_OPS_PER_RECORD: usize = 10_000;

/// Largest allowed `wal_ops_per_record`; keeps a record of the biggest
/// operations well under the frame payload limit
pub const MAX_WAL_OPS_PER_RECORD: usize = 100_000;

/// Main configuration for a SectorStore instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for engine metadata (WAL and index).
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal.log          (write-ahead log)
    ///     └── index/           (sled key-value index)
    ///
    /// Sector data lives in the storage folders added at runtime, each
    /// holding a single `sectors.dat` file.
    pub data_dir: PathBuf,

    /// Size of every sector in bytes
    pub sector_size: u64,

    /// Max number of sectors a single storage folder may hold
    pub max_sectors_per_folder: u64,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync WAL
    pub wal_sync_strategy: WalSyncStrategy,

    /// Operations per WAL append record; longer operation lists, such as
    /// the relocations of a large shrink, are split across records
    pub wal_ops_per_record: usize,

    // -------------------------------------------------------------------------
    // Testing
    // -------------------------------------------------------------------------
    /// Fault-injection points, inactive unless armed
    pub disrupter: Disrupter,
}

/// WAL sync strategy
///
/// Commit and release records are always synced regardless of strategy;
/// the strategy governs intent and append records.
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./sectorstore_data"),
            sector_size: DEFAULT_SECTOR_SIZE,
            max_sectors_per_folder: DEFAULT_MAX_SECTORS_PER_FOLDER,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            wal_ops_per_record: DEFAULT_WAL_OPS_PER_RECORD,
            disrupter: Disrupter::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the config for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            return Err(StoreError::Config(format!(
                "sector size must be a non-zero power of two, got {}",
                self.sector_size
            )));
        }
        if self.max_sectors_per_folder == 0 {
            return Err(StoreError::Config(
                "max_sectors_per_folder must be at least 1".to_string(),
            ));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(StoreError::Config(
                "EveryNEntries sync strategy needs a count of at least 1".to_string(),
            ));
        }
        if self.wal_ops_per_record == 0 || self.wal_ops_per_record > MAX_WAL_OPS_PER_RECORD {
            return Err(StoreError::Config(format!(
                "wal_ops_per_record must be between 1 and {}, got {}",
                MAX_WAL_OPS_PER_RECORD, self.wal_ops_per_record
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for WAL and index)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the sector size (in bytes)
    pub fn sector_size(mut self, size: u64) -> Self {
        self.config.sector_size = size;
        self
    }

    /// Set the maximum number of sectors per folder
    pub fn max_sectors_per_folder(mut self, count: u64) -> Self {
        self.config.max_sectors_per_folder = count;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set how many operations one WAL record may carry
    pub fn wal_ops_per_record(mut self, count: usize) -> Self {
        self.config.wal_ops_per_record = count;
        self
    }

    /// Attach a disrupter for fault-injection tests
    pub fn disrupter(mut self, disrupter: Disrupter) -> Self {
        self.config.disrupter = disrupter;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
