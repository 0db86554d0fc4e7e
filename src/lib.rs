//! # SectorStore
//!
//! A crash-safe sector storage engine for storage hosts, with:
//! - Fixed-size, content-addressed sectors spread over storage folders
//! - Reference-counted deduplication of identical content
//! - A five-phase update protocol over a transactional Write-Ahead Log
//! - Crash recovery that finishes or reverts every committed update
//! - Two-tier locking: manager-wide RwLock plus per-sector locks
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │        write / read / delete_batch / add / resize / remove   │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ builds an update
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Update Protocol                          │
//! │   lock_resource → record_intent → prepare → process → release│
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┼─────────────────────┐
//!          │            │                     │
//!          ▼            ▼                     ▼
//!   ┌─────────────┐ ┌─────────────┐   ┌───────────────┐
//!   │     WAL     │ │    Index    │   │    Folders    │
//!   │ (txn log)   │ │   (sled)    │   │ (slot files)  │
//!   └─────────────┘ └─────────────┘   └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod disrupt;
pub mod error;

pub mod engine;
pub mod index;
pub mod storage;
pub mod update;
pub mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, WalSyncStrategy};
pub use disrupt::{Disrupter, Hold};
pub use engine::Engine;
pub use error::{Result, StoreError};
pub use storage::{FolderStatus, FolderUsage, SectorRoot};
pub use update::RecoveryReport;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of SectorStore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
