//! Tests for WAL Reader
//!
//! These tests verify:
//! - Reading back written records in order
//! - Clean end of file on empty logs
//! - Torn frames and bad checksums surface as corruption
//! - The iterator stops after the first error

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use sectorstore::config::WalSyncStrategy;
use sectorstore::wal::{Record, WalReader, WalWriter, HEADER_SIZE};
use sectorstore::StoreError;
use tempfile::TempDir;

use super::begin;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

fn write_entries(path: &PathBuf, count: u64) {
    let mut writer = WalWriter::open(path, WalSyncStrategy::EveryWrite).unwrap();
    for i in 1..=count {
        writer.append(begin(i)).unwrap();
    }
}

// =============================================================================
// Basic Reading Tests
// =============================================================================

#[test]
fn test_read_empty_wal() {
    let (_temp, wal_path) = setup_temp_wal();
    std::fs::File::create(&wal_path).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(reader.next_entry().unwrap().is_none());
    assert_eq!(reader.position(), 0);
}

#[test]
fn test_read_missing_file_fails() {
    let (_temp, wal_path) = setup_temp_wal();
    assert!(matches!(WalReader::open(&wal_path), Err(StoreError::Io(_))));
}

#[test]
fn test_read_back_in_order() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 5);

    let entries: Vec<_> = WalReader::open(&wal_path)
        .unwrap()
        .entries()
        .map(|e| e.unwrap())
        .collect();

    assert_eq!(entries.len(), 5);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.lsn, i as u64 + 1);
        assert_eq!(entry.record, begin(i as u64 + 1));
    }
}

#[test]
fn test_position_tracks_file_length() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 3);

    let mut reader = WalReader::open(&wal_path).unwrap();
    while reader.next_entry().unwrap().is_some() {}

    assert_eq!(reader.position(), std::fs::metadata(&wal_path).unwrap().len());
}

#[test]
fn test_mixed_record_kinds() {
    let (_temp, wal_path) = setup_temp_wal();
    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(begin(1)).unwrap();
        writer.append(Record::Commit { txn: 1 }).unwrap();
        writer.append(Record::Release { txn: 1 }).unwrap();
    }

    let txns: Vec<u64> = WalReader::open(&wal_path)
        .unwrap()
        .entries()
        .map(|e| e.unwrap().record.txn())
        .collect();
    assert_eq!(txns, vec![1, 1, 1]);
}

// =============================================================================
// Corruption Handling Tests
// =============================================================================

#[test]
fn test_partial_header_is_corruption() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 2);

    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&[0u8; HEADER_SIZE / 2]).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(reader.next_entry().unwrap().is_some());
    assert!(reader.next_entry().unwrap().is_some());
    assert!(matches!(
        reader.next_entry(),
        Err(StoreError::WalCorruption(_))
    ));
}

#[test]
fn test_partial_payload_is_corruption() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 2);

    let len = std::fs::metadata(&wal_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - 3).unwrap();

    let results: Vec<_> = WalReader::open(&wal_path).unwrap().entries().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(StoreError::WalCorruption(_))));
}

#[test]
fn test_iterator_stops_after_bad_crc() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 3);

    // Flip a payload byte of the first frame
    let mut bytes = std::fs::read(&wal_path).unwrap();
    bytes[HEADER_SIZE] ^= 0xFF;
    std::fs::write(&wal_path, &bytes).unwrap();

    let results: Vec<_> = WalReader::open(&wal_path).unwrap().entries().collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(StoreError::WalCorruption(_))));
}
