//! WAL Transactions
//!
//! Groups log records into transactions with an `append → commit → release`
//! lifecycle, and rebuilds the unreleased ones when the log is reopened.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::WalSyncStrategy;
use crate::error::{Result, StoreError};

use super::entry::TxnId;
use super::{Operation, Record, RecoveryResult, WalRecovery, WalWriter};

/// Shared handle to the write-ahead log
///
/// Cloning is cheap; every clone appends to the same file.
#[derive(Clone)]
pub struct Wal {
    inner: Arc<Mutex<WalState>>,
}

struct WalState {
    writer: WalWriter,
    next_txn: TxnId,
    /// Transactions begun but not yet released
    open: HashSet<TxnId>,
}

impl Wal {
    /// Open the log, returning every transaction that was never released
    ///
    /// Transactions come back in the order they began. The log is
    /// truncated when nothing is left open.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<(Self, Vec<Transaction>)> {
        let (entries, result) = if path.exists() {
            WalRecovery::recover(path)?
        } else {
            (Vec::new(), RecoveryResult::default())
        };

        if result.entries_recovered > 0 || result.entries_corrupted > 0 {
            info!(
                entries_recovered = result.entries_recovered,
                entries_corrupted = result.entries_corrupted,
                last_lsn = result.last_lsn,
                was_truncated = result.was_truncated,
                "WAL recovery scan"
            );
        }

        let mut pending: BTreeMap<TxnId, (Vec<Operation>, bool)> = BTreeMap::new();
        let mut max_txn = 0;
        for entry in entries {
            let txn = entry.record.txn();
            max_txn = max_txn.max(txn);
            match entry.record {
                Record::Begin { txn, ops } => {
                    pending.insert(txn, (ops, false));
                }
                Record::Append { txn, ops } => match pending.get_mut(&txn) {
                    Some((existing, _)) => existing.extend(ops),
                    None => warn!(txn, lsn = entry.lsn, "append for unknown transaction"),
                },
                Record::Commit { txn } => match pending.get_mut(&txn) {
                    Some((_, committed)) => *committed = true,
                    None => warn!(txn, lsn = entry.lsn, "commit for unknown transaction"),
                },
                Record::Release { txn } => {
                    pending.remove(&txn);
                }
            }
        }

        let mut writer = WalWriter::open_at(path, sync_strategy, Some(result.last_lsn))?;
        if pending.is_empty() && result.entries_recovered > 0 {
            writer.truncate()?;
        }

        let wal = Self {
            inner: Arc::new(Mutex::new(WalState {
                writer,
                next_txn: max_txn + 1,
                open: pending.keys().copied().collect(),
            })),
        };

        let txns = pending
            .into_iter()
            .map(|(id, (ops, committed))| Transaction {
                id,
                ops,
                committed,
                wal: wal.clone(),
            })
            .collect();

        Ok((wal, txns))
    }

    /// Begin a transaction whose first record carries `ops`
    pub fn new_transaction(&self, ops: Vec<Operation>) -> Result<Transaction> {
        if ops.is_empty() {
            return Err(StoreError::WalWrite(
                "transaction needs at least one operation".to_string(),
            ));
        }
        let mut state = self.inner.lock();
        let id = state.next_txn;
        state.writer.append(Record::Begin {
            txn: id,
            ops: ops.clone(),
        })?;
        state.next_txn += 1;
        state.open.insert(id);
        debug!(txn = id, "transaction begun");

        Ok(Transaction {
            id,
            ops,
            committed: false,
            wal: self.clone(),
        })
    }

    /// Number of transactions begun but not released
    pub fn open_transactions(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// LSN the next record will receive
    pub fn current_lsn(&self) -> u64 {
        self.inner.lock().writer.current_lsn()
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().writer.sync()
    }
}

/// An open transaction in the log
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    ops: Vec<Operation>,
    committed: bool,
    wal: Wal,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("open_transactions", &self.open_transactions())
            .finish()
    }
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// All operations of the transaction, intent first
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Append more operations; only valid before commit
    pub fn append(&mut self, ops: Vec<Operation>) -> Result<()> {
        if self.committed {
            return Err(StoreError::WalWrite(format!(
                "transaction {} already committed",
                self.id
            )));
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.wal.inner.lock().writer.append(Record::Append {
            txn: self.id,
            ops: ops.clone(),
        })?;
        self.ops.extend(ops);
        Ok(())
    }

    /// Append operations split over records of at most `per_record`
    /// operations each
    pub fn append_chunked(&mut self, ops: Vec<Operation>, per_record: usize) -> Result<()> {
        if per_record == 0 {
            return Err(StoreError::WalWrite(
                "records must carry at least one operation".to_string(),
            ));
        }
        let mut ops = ops.into_iter().peekable();
        while ops.peek().is_some() {
            self.append(ops.by_ref().take(per_record).collect())?;
        }
        Ok(())
    }

    /// Make the transaction durable
    ///
    /// Once this returns the operation must eventually complete, either
    /// inline or in the recovery scan.
    pub fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.wal
            .inner
            .lock()
            .writer
            .append_durable(Record::Commit { txn: self.id })?;
        self.committed = true;
        debug!(txn = self.id, "transaction committed");
        Ok(())
    }

    /// Remove the transaction from future recovery scans
    ///
    /// When this was the last open transaction the log file is truncated.
    pub fn release(self) -> Result<()> {
        let mut state = self.wal.inner.lock();
        state
            .writer
            .append_durable(Record::Release { txn: self.id })?;
        state.open.remove(&self.id);
        debug!(txn = self.id, "transaction released");
        if state.open.is_empty() {
            state.writer.truncate()?;
        }
        Ok(())
    }
}
