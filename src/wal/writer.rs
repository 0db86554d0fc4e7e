//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::config::WalSyncStrategy;
use crate::error::{Result, StoreError};

use super::{Record, WalEntry};

/// Writes entries to the WAL file
pub struct WalWriter {
    /// Path of the log file
    path: PathBuf,

    /// Open handle, positioned at the end of the log
    file: File,

    /// LSN the next appended entry receives
    next_lsn: u64,

    /// How often to fsync
    sync_strategy: WalSyncStrategy,

    /// Entries written since the last fsync
    unsynced: usize,

    /// Set once the file may no longer end on a frame boundary, or an
    /// fsync failed; every later append is refused
    poisoned: bool,
}

impl WalWriter {
    /// Open or create a WAL file, continuing after any existing entries
    ///
    /// The file is expected to hold only valid frames; run
    /// [`WalRecovery::recover`](super::WalRecovery::recover) first to cut
    /// off a torn tail.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        Self::open_at(path, sync_strategy, None)
    }

    /// Open with a known last LSN, skipping the scan of existing entries
    pub fn open_at(
        path: &Path,
        sync_strategy: WalSyncStrategy,
        last_lsn: Option<u64>,
    ) -> Result<Self> {
        let last_lsn = match last_lsn {
            Some(lsn) => lsn,
            None if path.exists() => {
                let mut last = 0;
                for entry in super::WalReader::open(path)?.entries() {
                    last = entry?.lsn;
                }
                last
            }
            None => 0,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_lsn: last_lsn + 1,
            sync_strategy,
            unsynced: 0,
            poisoned: false,
        })
    }

    /// Append a record, returning the LSN it was written at
    ///
    /// Syncs according to the configured strategy.
    pub fn append(&mut self, record: Record) -> Result<u64> {
        let lsn = self.write_entry(record)?;
        let should_sync = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced >= count,
        };
        if should_sync {
            self.sync()?;
        }
        Ok(lsn)
    }

    /// Append a record and fsync regardless of strategy
    pub fn append_durable(&mut self, record: Record) -> Result<u64> {
        let lsn = self.write_entry(record)?;
        self.sync()?;
        Ok(lsn)
    }

    /// Write one frame
    ///
    /// A write that fails part way is cut off again so the next frame
    /// starts where this one did.
    fn write_entry(&mut self, record: Record) -> Result<u64> {
        self.check_usable()?;
        let lsn = self.next_lsn;
        let frame = WalEntry::new(lsn, record).serialize()?;

        let start = self.file.stream_position()?;
        if let Err(e) = self.file.write_all(&frame) {
            self.discard_from(start);
            return Err(e.into());
        }
        self.next_lsn += 1;
        self.unsynced += 1;
        Ok(lsn)
    }

    /// Cut the file back to `start`, poisoning the writer if that fails
    fn discard_from(&mut self, start: u64) {
        let rollback = self
            .file
            .set_len(start)
            .and_then(|()| self.file.seek(SeekFrom::Start(start)).map(|_| ()));
        if let Err(e) = rollback {
            error!(
                path = %self.path.display(),
                offset = start,
                error = %e,
                "cannot cut off failed WAL write; refusing further appends"
            );
            self.poisoned = true;
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::WalWrite(format!(
                "{} is unusable after a failed write; reopen to recover it",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Force sync to disk
    ///
    /// A failed fsync leaves it unknown which entries reached the disk, so
    /// it poisons the writer.
    pub fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        if let Err(e) = self.file.sync_data() {
            error!(path = %self.path.display(), error = %e, "WAL fsync failed; refusing further appends");
            self.poisoned = true;
            return Err(e.into());
        }
        self.unsynced = 0;
        Ok(())
    }

    /// Drop every entry in the log
    ///
    /// LSNs keep counting up so entries written afterwards never reuse one.
    pub fn truncate(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self
            .file
            .set_len(0)
            .and_then(|()| self.file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "WAL truncate failed; refusing further appends");
            self.poisoned = true;
            return Err(e.into());
        }
        self.unsynced = 0;
        Ok(())
    }

    /// True once a failed write, fsync or truncate has made the writer
    /// refuse appends
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Get the LSN the next entry will receive
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Number of entries written since the last sync
    pub fn uncommitted_count(&self) -> usize {
        self.unsynced
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
