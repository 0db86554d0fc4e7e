//! Write-Ahead Log (WAL) Module
//!
//! The single durability boundary of the engine.
//!
//! ## Responsibilities
//! - Record update intents before any index or data-file mutation
//! - Group records into transactions (begin, append, commit, release)
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Hand unreleased transactions back to the engine after a crash
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//!
//! `Data` is a bincode-encoded [`Record`] plus a timestamp.

mod entry;
mod writer;
mod reader;
mod recovery;
mod transaction;

pub use entry::{Operation, OpName, Record, TxnId, WalEntry, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use writer::WalWriter;
pub use reader::{WalIterator, WalReader};
pub use recovery::{RecoveryResult, WalRecovery};
pub use transaction::{Transaction, Wal};
