//! Tests for the fixed-slot data file
//!
//! These tests verify:
//! - Creation sizes the file to whole slots
//! - Slots are written and read back independently
//! - Partial sectors and slots past the end are rejected
//! - Resizing grows and truncates

use sectorstore::storage::DataFile;
use sectorstore::StoreError;
use tempfile::TempDir;

use super::SECTOR_SIZE;

fn sector(fill: u8) -> Vec<u8> {
    vec![fill; SECTOR_SIZE as usize]
}

// =============================================================================
// Create / Open Tests
// =============================================================================

#[test]
fn test_create_sizes_file() {
    let temp = TempDir::new().unwrap();
    let file = DataFile::create(&temp.path().join("sectors.dat"), 8, SECTOR_SIZE).unwrap();

    assert_eq!(file.len().unwrap(), 8 * SECTOR_SIZE);
    assert!(!file.is_empty().unwrap());
}

#[test]
fn test_create_refuses_existing_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("sectors.dat");
    DataFile::create(&path, 1, SECTOR_SIZE).unwrap();

    assert!(matches!(
        DataFile::create(&path, 1, SECTOR_SIZE),
        Err(StoreError::Io(_))
    ));
}

#[test]
fn test_new_slots_are_zeroed() {
    let temp = TempDir::new().unwrap();
    let file = DataFile::create(&temp.path().join("sectors.dat"), 2, SECTOR_SIZE).unwrap();

    assert_eq!(file.read_sector(1).unwrap(), sector(0));
}

// =============================================================================
// Read / Write Tests
// =============================================================================

#[test]
fn test_slots_are_independent() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("sectors.dat");
    {
        let file = DataFile::create(&path, 4, SECTOR_SIZE).unwrap();
        file.write_sector(0, &sector(0xA0)).unwrap();
        file.write_sector(3, &sector(0xA3)).unwrap();
    }

    let file = DataFile::open(&path, SECTOR_SIZE).unwrap();
    assert_eq!(file.read_sector(0).unwrap(), sector(0xA0));
    assert_eq!(file.read_sector(1).unwrap(), sector(0));
    assert_eq!(file.read_sector(3).unwrap(), sector(0xA3));
}

#[test]
fn test_partial_sector_rejected() {
    let temp = TempDir::new().unwrap();
    let file = DataFile::create(&temp.path().join("sectors.dat"), 1, SECTOR_SIZE).unwrap();

    assert!(matches!(
        file.write_sector(0, &[1u8; 100]),
        Err(StoreError::InvalidInput(_))
    ));
}

#[test]
fn test_read_past_end_is_corruption() {
    let temp = TempDir::new().unwrap();
    let file = DataFile::create(&temp.path().join("sectors.dat"), 2, SECTOR_SIZE).unwrap();

    assert!(matches!(
        file.read_sector(2),
        Err(StoreError::Corruption(_))
    ));
}

// =============================================================================
// Resize Tests
// =============================================================================

#[test]
fn test_grow_then_truncate() {
    let temp = TempDir::new().unwrap();
    let file = DataFile::create(&temp.path().join("sectors.dat"), 2, SECTOR_SIZE).unwrap();
    file.write_sector(1, &sector(7)).unwrap();

    file.set_len_sectors(6).unwrap();
    assert_eq!(file.len().unwrap(), 6 * SECTOR_SIZE);
    assert_eq!(file.read_sector(1).unwrap(), sector(7));
    assert_eq!(file.read_sector(5).unwrap(), sector(0));

    file.set_len_sectors(1).unwrap();
    assert_eq!(file.len().unwrap(), SECTOR_SIZE);
    assert!(file.read_sector(1).is_err());
}
