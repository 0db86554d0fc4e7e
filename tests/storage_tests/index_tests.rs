//! Tests for the sled index
//!
//! These tests verify:
//! - Sector rows and folder membership are written and dropped together
//! - Folder rows and the path mapping
//! - The host salt and sector size are pinned on first open
//! - Batches survive reopening the index

use std::path::PathBuf;

use sectorstore::index::IndexDb;
use sectorstore::storage::{FolderRecord, Sector, SectorId, SectorRoot};
use sectorstore::StoreError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_index() -> (TempDir, IndexDb) {
    let temp = TempDir::new().unwrap();
    let db = IndexDb::open(&temp.path().join("index")).unwrap();
    (temp, db)
}

fn sector(seed: u8, folder_id: u32, index: u64) -> Sector {
    let root = SectorRoot::from_content(&[seed]);
    Sector {
        id: SectorId::derive(&[0u8; 32], &root),
        folder_id,
        index,
        count: 1,
    }
}

// =============================================================================
// Sector Row Tests
// =============================================================================

#[test]
fn test_save_and_get_sector() {
    let (_temp, db) = setup_index();
    let s = sector(1, 1, 7);

    let mut batch = db.new_batch();
    batch.save_sector(&s).unwrap();
    assert!(!batch.is_empty());
    db.write_batch(batch).unwrap();

    assert_eq!(db.get_sector(&s.id).unwrap(), Some(s));
    assert_eq!(db.sector_ids_in_folder(1).unwrap(), vec![s.id]);
    assert_eq!(db.sector_count(), 1);
}

#[test]
fn test_delete_sector_drops_membership() {
    let (_temp, db) = setup_index();
    let a = sector(1, 1, 0);
    let b = sector(2, 1, 1);

    let mut batch = db.new_batch();
    batch.save_sector(&a).unwrap();
    batch.save_sector(&b).unwrap();
    db.write_batch(batch).unwrap();

    let mut batch = db.new_batch();
    batch.delete_sector(&a);
    db.write_batch(batch).unwrap();

    assert!(db.get_sector(&a.id).unwrap().is_none());
    assert_eq!(db.sector_ids_in_folder(1).unwrap(), vec![b.id]);
    assert_eq!(db.sector_count(), 1);
}

#[test]
fn test_moving_sector_between_folders() {
    let (_temp, db) = setup_index();
    let before = sector(3, 1, 4);

    let mut batch = db.new_batch();
    batch.save_sector(&before).unwrap();
    db.write_batch(batch).unwrap();

    let after = Sector {
        folder_id: 2,
        index: 0,
        ..before
    };
    let mut batch = db.new_batch();
    batch.unlink_sector(before.folder_id, &before.id);
    batch.save_sector(&after).unwrap();
    db.write_batch(batch).unwrap();

    assert!(db.sector_ids_in_folder(1).unwrap().is_empty());
    assert_eq!(db.sector_ids_in_folder(2).unwrap(), vec![after.id]);
    assert_eq!(db.get_sector(&after.id).unwrap().unwrap().folder_id, 2);
}

#[test]
fn test_membership_scan_is_per_folder() {
    let (_temp, db) = setup_index();
    let mut batch = db.new_batch();
    for i in 0..5u8 {
        batch.save_sector(&sector(i, 1 + (i as u32 % 2), i as u64)).unwrap();
    }
    db.write_batch(batch).unwrap();

    assert_eq!(db.sector_ids_in_folder(1).unwrap().len(), 3);
    assert_eq!(db.sector_ids_in_folder(2).unwrap().len(), 2);
    assert!(db.sector_ids_in_folder(3).unwrap().is_empty());
}

// =============================================================================
// Folder Row Tests
// =============================================================================

#[test]
fn test_folder_rows() {
    let (_temp, db) = setup_index();
    let one = FolderRecord::empty(1, PathBuf::from("/data/one"), 100);
    let two = FolderRecord::empty(2, PathBuf::from("/data/two"), 65);

    let mut batch = db.new_batch();
    batch.save_folder(&two).unwrap();
    batch.save_folder(&one).unwrap();
    db.write_batch(batch).unwrap();

    assert_eq!(db.get_folder(2).unwrap(), Some(two.clone()));
    assert_eq!(db.folder_id_by_path(&one.path).unwrap(), Some(1));
    assert_eq!(db.folder_records().unwrap(), vec![one.clone(), two]);

    let mut batch = db.new_batch();
    batch.delete_folder(1, &one.path);
    db.write_batch(batch).unwrap();

    assert!(db.get_folder(1).unwrap().is_none());
    assert!(db.folder_id_by_path(&one.path).unwrap().is_none());
    assert_eq!(db.folder_records().unwrap().len(), 1);
}

#[test]
fn test_empty_record_bitmap_width() {
    assert_eq!(FolderRecord::empty(1, PathBuf::from("/a"), 64).usage.len(), 1);
    assert_eq!(FolderRecord::empty(1, PathBuf::from("/a"), 65).usage.len(), 2);
}

// =============================================================================
// Metadata Tests
// =============================================================================

#[test]
fn test_salt_is_stable_across_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("index");

    let salt = {
        let db = IndexDb::open(&path).unwrap();
        db.load_or_create_salt().unwrap()
    };

    let db = IndexDb::open(&path).unwrap();
    assert_eq!(db.load_or_create_salt().unwrap(), salt);
}

#[test]
fn test_fresh_indexes_get_random_salts() {
    let (_a, first) = setup_index();
    let (_b, second) = setup_index();

    let salt = first.load_or_create_salt().unwrap();
    assert_ne!(salt, [0u8; 32]);
    assert_ne!(salt, second.load_or_create_salt().unwrap());
}

#[test]
fn test_sector_size_pinned() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("index");
    {
        let db = IndexDb::open(&path).unwrap();
        db.check_sector_size(4096).unwrap();
    }

    let db = IndexDb::open(&path).unwrap();
    db.check_sector_size(4096).unwrap();
    assert!(matches!(
        db.check_sector_size(8192),
        Err(StoreError::Config(_))
    ));
}

#[test]
fn test_rows_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("index");
    let s = sector(9, 3, 2);
    {
        let db = IndexDb::open(&path).unwrap();
        let mut batch = db.new_batch();
        batch.save_sector(&s).unwrap();
        db.write_batch(batch).unwrap();
    }

    let db = IndexDb::open(&path).unwrap();
    assert_eq!(db.get_sector(&s.id).unwrap(), Some(s));
}
