//! Update Module
//!
//! Every mutation of the store is an update driven through five phases.
//!
//! ## Protocol
//! ```text
//!  lock_resource ─► record_intent ─► prepare(target) ─► process(target) ─► release(outcome)
//!  (sector locks    (Begin record,   (validate, stage   (Commit record,    (always runs)
//!   or exclusive     before any       batch, reserve     data I/O, batch
//!   manager lock)    mutation)        slots)             write)
//! ```
//!
//! The commit record written at the start of `process` is the durability
//! point. A failure before it unwinds the in-memory state and releases the
//! transaction. A failure after it leaves the transaction in the log and
//! the startup recovery scan finishes or reverts the update.
//!
//! ## Recovery
//! Each unreleased, committed transaction is decoded from the name of its
//! first operation back into the update that wrote it, then driven through
//! `prepare(RecoverCommitted) → process(RecoverCommitted) → release`.
//! Uncommitted transactions never touched durable state and are released.

mod add_folder;
mod add_sector;
mod delete_batch;
mod expand_folder;
mod relocate;
mod remove_folder;
mod shrink_folder;

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::storage::{ResourceLock, StorageManager};
use crate::wal::{OpName, Transaction};

pub use add_folder::AddFolderUpdate;
pub use add_sector::AddSectorUpdate;
pub use delete_batch::DeleteBatchUpdate;
pub use expand_folder::ExpandFolderUpdate;
pub use remove_folder::RemoveFolderUpdate;
pub use shrink_folder::ShrinkFolderUpdate;

/// Where `prepare` and `process` take their inputs from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Live call with caller input
    Normal,
    /// Rebuilt from a committed transaction during startup recovery
    RecoverCommitted,
}

/// How an update ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Finished,
    /// Recovery rolled the update back
    Reverted,
}

/// What `release` is cleaning up after
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'e> {
    Completed(Resolution),
    PrepareFailed(&'e StoreError),
    ProcessFailed(&'e StoreError),
}

impl Outcome<'_> {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Completed(_))
    }
}

/// The five-phase contract every update implements
pub trait Update: fmt::Display {
    /// Take the locks the update runs under
    fn lock_resource<'m>(&self, manager: &'m StorageManager) -> ResourceLock<'m>;

    /// Validate the input and begin the log transaction
    fn record_intent(&mut self, manager: &StorageManager) -> Result<()>;

    /// Stage every effect without touching durable state
    fn prepare(&mut self, manager: &StorageManager, target: Target) -> Result<()>;

    /// Commit, then apply the staged effects
    fn process(&mut self, manager: &StorageManager, target: Target) -> Result<Resolution>;

    /// Undo or keep in-memory state according to the outcome and settle
    /// the transaction
    fn release(&mut self, manager: &StorageManager, outcome: Outcome<'_>) -> Result<()>;

    /// Keep live calls off everything this update touched until the
    /// recovery scan on the next open resolves it
    fn defer_to_recovery(&self, manager: &StorageManager);

    fn transaction(&self) -> Option<&Transaction>;

    fn is_committed(&self) -> bool {
        self.transaction().is_some_and(Transaction::is_committed)
    }
}

/// Release a transaction, unless a failure after commit means recovery
/// still has to see it
pub(crate) fn settle(
    manager: &StorageManager,
    txn: Option<Transaction>,
    outcome: &Outcome<'_>,
) -> Result<()> {
    match txn {
        None => Ok(()),
        Some(txn) if txn.is_committed() && outcome.is_failure() => {
            warn!(txn = txn.id(), "transaction kept for recovery");
            Ok(())
        }
        Some(txn) => {
            manager.disrupt("update/before_release")?;
            txn.release()
        }
    }
}

fn release_after_failure(manager: &StorageManager, update: &mut dyn Update, outcome: Outcome<'_>) {
    if let Err(e) = update.release(manager, outcome) {
        error!(update = %update, error = %e, "release after failure did not complete");
    }
}

/// Fence off a committed update the log could not release
fn defer(manager: &StorageManager, update: &dyn Update, cause: StoreError) -> StoreError {
    update.defer_to_recovery(manager);
    error!(update = %update, error = %cause, "update failed after commit, deferred to recovery");
    StoreError::RecoveryPending(format!("{}: {}", update, cause))
}

/// Run an update through all five phases
///
/// A failure after commit, including one while releasing the transaction,
/// is reported as [`StoreError::RecoveryPending`]: the update stays in the
/// log and the next open resolves it.
pub fn execute(manager: &StorageManager, update: &mut dyn Update) -> Result<Resolution> {
    let _lock = update.lock_resource(manager);
    update.record_intent(manager)?;
    debug!(update = %update, "intent recorded");

    if let Err(e) = update.prepare(manager, Target::Normal) {
        debug!(update = %update, error = %e, "prepare failed");
        release_after_failure(manager, update, Outcome::PrepareFailed(&e));
        return Err(e);
    }

    match update.process(manager, Target::Normal) {
        Ok(resolution) => {
            // process only succeeds past the commit record
            if let Err(e) = update.release(manager, Outcome::Completed(resolution)) {
                return Err(defer(manager, update, e));
            }
            debug!(update = %update, "update finished");
            Ok(resolution)
        }
        Err(e) => {
            let committed = update.is_committed();
            release_after_failure(manager, update, Outcome::ProcessFailed(&e));
            if committed {
                Err(defer(manager, update, e))
            } else {
                Err(e)
            }
        }
    }
}

// =============================================================================
// Startup Recovery
// =============================================================================

/// Counts from one recovery scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Uncommitted transactions released untouched
    pub discarded: usize,
    pub finished: usize,
    pub reverted: usize,
    /// Transactions left in the log for operator attention
    pub failed: usize,
}

/// Resolve every transaction the log handed back on open
///
/// A transaction that cannot be recovered is logged and left in the log;
/// the scan moves on to the next one.
pub fn recover_transactions(manager: &StorageManager, txns: Vec<Transaction>) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    for txn in txns {
        let id = txn.id();
        if !txn.is_committed() {
            match txn.release() {
                Ok(()) => {
                    debug!(txn = id, "discarded uncommitted transaction");
                    report.discarded += 1;
                }
                Err(e) => {
                    error!(txn = id, error = %e, "cannot release uncommitted transaction");
                    report.failed += 1;
                }
            }
            continue;
        }

        match recover_one(manager, txn) {
            Ok(Resolution::Finished) => {
                info!(txn = id, "recovered transaction finished");
                report.finished += 1;
            }
            Ok(Resolution::Reverted) => {
                info!(txn = id, "recovered transaction reverted");
                report.reverted += 1;
            }
            Err(e) => {
                error!(txn = id, error = %e, "recovery failed, transaction left in log");
                report.failed += 1;
            }
        }
    }

    report
}

/// Resolve one committed transaction
///
/// An update that stays in the log is fenced off like a live update that
/// failed after commit, so nothing run before the next open can invalidate
/// what it logged.
fn recover_one(manager: &StorageManager, txn: Transaction) -> Result<Resolution> {
    let mut decoded = match decode(txn) {
        Ok(decoded) => decoded,
        Err(e) => {
            manager.mark_layout_awaiting_recovery();
            return Err(e);
        }
    };
    let update = decoded.as_mut();
    let _lock = update.lock_resource(manager);

    if let Err(e) = update.prepare(manager, Target::RecoverCommitted) {
        release_after_failure(manager, update, Outcome::PrepareFailed(&e));
        update.defer_to_recovery(manager);
        return Err(e);
    }
    match update.process(manager, Target::RecoverCommitted) {
        Ok(resolution) => {
            if let Err(e) = update.release(manager, Outcome::Completed(resolution)) {
                update.defer_to_recovery(manager);
                return Err(e);
            }
            Ok(resolution)
        }
        Err(e) => {
            release_after_failure(manager, update, Outcome::ProcessFailed(&e));
            update.defer_to_recovery(manager);
            Err(e)
        }
    }
}

/// Rebuild the update that wrote a transaction
fn decode(txn: Transaction) -> Result<Box<dyn Update>> {
    let name = txn
        .ops()
        .first()
        .map(|op| op.name)
        .ok_or_else(|| StoreError::Corruption(format!("transaction {} is empty", txn.id())))?;

    Ok(match name {
        OpName::AddSector => Box::new(AddSectorUpdate::from_transaction(txn)?),
        OpName::DeleteSectorBatch => Box::new(DeleteBatchUpdate::from_transaction(txn)?),
        OpName::AddFolder => Box::new(AddFolderUpdate::from_transaction(txn)?),
        OpName::ExpandFolder => Box::new(ExpandFolderUpdate::from_transaction(txn)?),
        OpName::ShrinkFolder => Box::new(ShrinkFolderUpdate::from_transaction(txn)?),
        OpName::RemoveFolder => Box::new(RemoveFolderUpdate::from_transaction(txn)?),
        OpName::PlaceSector | OpName::DeleteSector | OpName::RelocateSector => {
            return Err(StoreError::Corruption(format!(
                "transaction {} starts with {:?}",
                txn.id(),
                name
            )))
        }
    })
}

/// Decode every operation of one kind, in log order
pub(crate) fn decode_ops<T>(txn: &Transaction, name: OpName) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    txn.ops()
        .iter()
        .filter(|op| op.name == name)
        .map(|op| op.decode())
        .collect()
}

/// Decode the intent carried by the first operation
pub(crate) fn decode_intent<T>(txn: &Transaction, name: OpName) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    match txn.ops().first() {
        Some(op) if op.name == name => op.decode(),
        _ => Err(StoreError::Corruption(format!(
            "transaction {} does not start with {:?}",
            txn.id(),
            name
        ))),
    }
}

/// The transaction an update must hold past `record_intent`
pub(crate) fn open_txn(txn: &mut Option<Transaction>) -> Result<&mut Transaction> {
    txn.as_mut()
        .ok_or_else(|| StoreError::Corruption("update has no open transaction".to_string()))
}
