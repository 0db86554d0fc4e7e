//! Fixed-slot data file
//!
//! Slot `i` occupies bytes `[i * sector_size, (i + 1) * sector_size)`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

/// A folder's backing file, divided into sector-sized slots
pub struct DataFile {
    path: PathBuf,

    /// Seek + read/write pairs must not interleave
    file: Mutex<File>,

    sector_size: u64,
}

impl DataFile {
    /// Create a new data file holding `num_sectors` zeroed slots
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path, num_sectors: u64, sector_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(num_sectors * sector_size)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            sector_size,
        })
    }

    /// Open an existing data file
    pub fn open(path: &Path, sector_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            sector_size,
        })
    }

    /// Read the sector stored in slot `index`
    pub fn read_sector(&self, index: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.sector_size as usize];
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if (index + 1) * self.sector_size > len {
            return Err(StoreError::Corruption(format!(
                "slot {} lies beyond the end of {}",
                index,
                self.path.display()
            )));
        }
        file.seek(SeekFrom::Start(index * self.sector_size))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write a full sector into slot `index` and sync it
    pub fn write_sector(&self, index: u64, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.sector_size {
            return Err(StoreError::InvalidInput(format!(
                "sector data must be {} bytes, got {}",
                self.sector_size,
                data.len()
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index * self.sector_size))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Grow or truncate the file to exactly `num_sectors` slots
    pub fn set_len_sectors(&self, num_sectors: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(num_sectors * self.sector_size)?;
        file.sync_all()?;
        Ok(())
    }

    /// Current file length in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
