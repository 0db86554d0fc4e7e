//! Tests for WAL Transactions
//!
//! These tests verify:
//! - Begin/append/commit/release lifecycle
//! - Unreleased transactions come back on reopen, with their commit state
//! - The log is truncated once nothing is left open
//! - Transaction ids stay unique across reopen

use std::path::PathBuf;

use sectorstore::config::WalSyncStrategy;
use sectorstore::wal::{OpName, Record, Transaction, Wal, WalReader, WalWriter};
use sectorstore::StoreError;
use tempfile::TempDir;

use super::{begin, op};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("wal.log");
    (temp_dir, wal_path)
}

fn open(path: &PathBuf) -> (Wal, Vec<Transaction>) {
    Wal::open(path, WalSyncStrategy::EveryWrite).unwrap()
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_empty_transaction_rejected() {
    let (_temp, wal_path) = setup_temp_wal();
    let (wal, _) = open(&wal_path);

    assert!(matches!(
        wal.new_transaction(Vec::new()),
        Err(StoreError::WalWrite(_))
    ));
    assert_eq!(wal.open_transactions(), 0);
}

#[test]
fn test_full_lifecycle_truncates_log() {
    let (_temp, wal_path) = setup_temp_wal();
    let (wal, pending) = open(&wal_path);
    assert!(pending.is_empty());

    let mut txn = wal.new_transaction(vec![op(OpName::AddSector, 16)]).unwrap();
    txn.append(vec![op(OpName::PlaceSector, 8)]).unwrap();
    assert_eq!(txn.ops().len(), 2);
    assert_eq!(wal.open_transactions(), 1);

    txn.commit().unwrap();
    assert!(txn.is_committed());
    txn.release().unwrap();

    assert_eq!(wal.open_transactions(), 0);
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);
}

#[test]
fn test_append_chunked_splits_records() {
    let (_temp, wal_path) = setup_temp_wal();
    let (wal, _) = open(&wal_path);

    let mut txn = wal.new_transaction(vec![op(OpName::ShrinkFolder, 4)]).unwrap();
    let ops = (1..=5).map(|len| op(OpName::RelocateSector, len)).collect();
    txn.append_chunked(ops, 2).unwrap();
    txn.commit().unwrap();
    drop(txn);
    drop(wal);

    let appends = WalReader::open(&wal_path)
        .unwrap()
        .entries()
        .filter(|e| matches!(e.as_ref().unwrap().record, Record::Append { .. }))
        .count();
    assert_eq!(appends, 3);

    let (_wal, pending) = open(&wal_path);
    assert_eq!(pending.len(), 1);
    let lens: Vec<usize> = pending[0].ops().iter().map(|o| o.data.len()).collect();
    assert_eq!(lens, vec![4, 1, 2, 3, 4, 5]);
}

#[test]
fn test_append_chunked_rejects_empty_records() {
    let (_temp, wal_path) = setup_temp_wal();
    let (wal, _) = open(&wal_path);

    let mut txn = wal.new_transaction(vec![op(OpName::ShrinkFolder, 4)]).unwrap();
    assert!(matches!(
        txn.append_chunked(vec![op(OpName::RelocateSector, 4)], 0),
        Err(StoreError::WalWrite(_))
    ));
    assert_eq!(txn.ops().len(), 1);
}

#[test]
fn test_append_after_commit_fails() {
    let (_temp, wal_path) = setup_temp_wal();
    let (wal, _) = open(&wal_path);

    let mut txn = wal.new_transaction(vec![op(OpName::ShrinkFolder, 4)]).unwrap();
    txn.commit().unwrap();

    assert!(matches!(
        txn.append(vec![op(OpName::RelocateSector, 4)]),
        Err(StoreError::WalWrite(_))
    ));
}

#[test]
fn test_log_kept_while_any_transaction_open() {
    let (_temp, wal_path) = setup_temp_wal();
    let (wal, _) = open(&wal_path);

    let first = wal.new_transaction(vec![op(OpName::AddSector, 4)]).unwrap();
    let second = wal.new_transaction(vec![op(OpName::AddSector, 4)]).unwrap();
    assert_ne!(first.id(), second.id());

    first.release().unwrap();
    assert!(std::fs::metadata(&wal_path).unwrap().len() > 0);

    second.release().unwrap();
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);
}

// =============================================================================
// Reopen Tests
// =============================================================================

#[test]
fn test_unreleased_transactions_survive_reopen() {
    let (_temp, wal_path) = setup_temp_wal();
    let (committed_id, uncommitted_id) = {
        let (wal, _) = open(&wal_path);

        let mut committed = wal.new_transaction(vec![op(OpName::ShrinkFolder, 10)]).unwrap();
        committed
            .append(vec![op(OpName::RelocateSector, 20), op(OpName::RelocateSector, 20)])
            .unwrap();
        committed.commit().unwrap();

        let uncommitted = wal.new_transaction(vec![op(OpName::AddSector, 10)]).unwrap();

        let released = wal.new_transaction(vec![op(OpName::ExpandFolder, 10)]).unwrap();
        released.release().unwrap();

        (committed.id(), uncommitted.id())
    };

    let (wal, pending) = open(&wal_path);

    assert_eq!(pending.len(), 2);
    assert_eq!(wal.open_transactions(), 2);

    assert_eq!(pending[0].id(), committed_id);
    assert!(pending[0].is_committed());
    assert_eq!(pending[0].ops().len(), 3);
    assert_eq!(pending[0].ops()[0].name, OpName::ShrinkFolder);
    assert_eq!(pending[0].ops()[2].name, OpName::RelocateSector);

    assert_eq!(pending[1].id(), uncommitted_id);
    assert!(!pending[1].is_committed());
}

#[test]
fn test_released_recovered_transactions_truncate_log() {
    let (_temp, wal_path) = setup_temp_wal();
    {
        let (wal, _) = open(&wal_path);
        let mut txn = wal.new_transaction(vec![op(OpName::AddFolder, 4)]).unwrap();
        txn.commit().unwrap();
    }

    let (wal, pending) = open(&wal_path);
    for txn in pending {
        txn.release().unwrap();
    }

    assert_eq!(wal.open_transactions(), 0);
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);
}

#[test]
fn test_fully_released_log_truncated_on_open() {
    let (_temp, wal_path) = setup_temp_wal();
    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(begin(1)).unwrap();
        writer.append(Record::Commit { txn: 1 }).unwrap();
        writer.append(Record::Release { txn: 1 }).unwrap();
    }

    let (wal, pending) = open(&wal_path);

    assert!(pending.is_empty());
    assert_eq!(wal.open_transactions(), 0);
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);
}

#[test]
fn test_txn_ids_unique_across_reopen() {
    let (_temp, wal_path) = setup_temp_wal();
    let old_id = {
        let (wal, _) = open(&wal_path);
        let txn = wal.new_transaction(vec![op(OpName::AddSector, 4)]).unwrap();
        txn.id()
    };

    let (wal, pending) = open(&wal_path);
    let txn = wal.new_transaction(vec![op(OpName::AddSector, 4)]).unwrap();

    assert_eq!(pending[0].id(), old_id);
    assert!(txn.id() > old_id);
}
