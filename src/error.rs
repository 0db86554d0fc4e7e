//! Error types for SectorStore
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for SectorStore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Index error: {0}")]
    Index(#[from] sled::Error),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Caller-facing Errors (no side effects)
    // -------------------------------------------------------------------------
    #[error("Storage engine is stopped")]
    Stopped,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sector not found: {0}")]
    SectorNotFound(String),

    #[error("Storage folder not found: {}", .0.display())]
    FolderNotFound(PathBuf),

    #[error("Path already in use: {}", .0.display())]
    PathInUse(PathBuf),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("No free sector slot available")]
    Full,

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// The update committed but failed afterwards; the recovery scan on the
    /// next startup finishes or reverts it.
    #[error("Update committed, resolution deferred to recovery: {0}")]
    RecoveryPending(String),

    /// A fault-injection point fired.
    #[error("Disrupted at {0}")]
    Disrupted(&'static str),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
