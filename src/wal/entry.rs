//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their on-disk
//! frame encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Frame header size: LSN (8) + CRC (4) + Len (4) = 16 bytes
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single frame payload (64 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Transaction identifier within the log
pub type TxnId = u64;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// The transaction record carried by this entry
    pub record: Record,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Transaction lifecycle records
///
/// A transaction opens with `Begin`, may grow through any number of
/// `Append`s, becomes durable with `Commit` and disappears from future
/// recovery scans with `Release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Begin { txn: TxnId, ops: Vec<Operation> },
    Append { txn: TxnId, ops: Vec<Operation> },
    Commit { txn: TxnId },
    Release { txn: TxnId },
}

impl Record {
    /// Transaction this record belongs to
    pub fn txn(&self) -> TxnId {
        match self {
            Record::Begin { txn, .. }
            | Record::Append { txn, .. }
            | Record::Commit { txn }
            | Record::Release { txn } => *txn,
        }
    }
}

/// Discriminant of a logged operation
///
/// The first operation of a transaction names the update that created it,
/// which is how recovery knows which update to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpName {
    AddSector,
    PlaceSector,
    DeleteSectorBatch,
    DeleteSector,
    AddFolder,
    ExpandFolder,
    ShrinkFolder,
    RemoveFolder,
    RelocateSector,
}

/// A named, serialized operation inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: OpName,
    pub data: Vec<u8>,
}

impl Operation {
    /// Encode a persist struct under the given name
    pub fn encode<T: Serialize>(name: OpName, persist: &T) -> Result<Self> {
        Ok(Self {
            name,
            data: bincode::serialize(persist)?,
        })
    }

    /// Decode the persist struct carried by this operation
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.data)?)
    }
}

#[derive(Serialize)]
struct BodyRef<'a> {
    record: &'a Record,
    timestamp: u64,
}

#[derive(Deserialize)]
struct Body {
    record: Record,
    timestamp: u64,
}

impl WalEntry {
    /// Create a new entry stamped with the current time
    pub fn new(lsn: u64, record: Record) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            lsn,
            record,
            timestamp,
        }
    }

    /// Encode as a full frame: `[lsn][crc][len][payload]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&BodyRef {
            record: &self.record,
            timestamp: self.timestamp,
        })?;
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(StoreError::WalWrite(format!(
                "entry payload of {} bytes exceeds limit",
                payload.len()
            )));
        }
        let len = payload.len() as u32;
        let crc = Self::compute_crc(self.lsn, len, &payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&self.lsn.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a full frame, verifying its checksum
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::WalCorruption(format!(
                "frame of {} bytes is shorter than header",
                bytes.len()
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let (lsn, crc, len) = Self::decode_header(&header)?;

        let payload = &bytes[HEADER_SIZE..];
        if payload.len() != len as usize {
            return Err(StoreError::WalCorruption(format!(
                "frame length mismatch: header says {}, got {}",
                len,
                payload.len()
            )));
        }
        Self::from_parts(lsn, crc, payload)
    }

    /// Split a frame header into (lsn, crc, payload length)
    pub(crate) fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(u64, u32, u32)> {
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&header[0..8]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&header[8..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[12..16]);

        let len = u32::from_le_bytes(len);
        if len > MAX_PAYLOAD_SIZE {
            return Err(StoreError::WalCorruption(format!(
                "frame length {} exceeds limit",
                len
            )));
        }
        Ok((u64::from_le_bytes(lsn), u32::from_le_bytes(crc), len))
    }

    /// Rebuild an entry from a decoded header and its payload
    pub(crate) fn from_parts(lsn: u64, crc: u32, payload: &[u8]) -> Result<Self> {
        let expected = Self::compute_crc(lsn, payload.len() as u32, payload);
        if expected != crc {
            return Err(StoreError::WalCorruption(format!(
                "CRC mismatch at lsn {}: stored {:#010x}, computed {:#010x}",
                lsn, crc, expected
            )));
        }
        let body: Body = bincode::deserialize(payload)
            .map_err(|e| StoreError::WalCorruption(format!("undecodable entry at lsn {}: {}", lsn, e)))?;
        Ok(Self {
            lsn,
            record: body.record,
            timestamp: body.timestamp,
        })
    }

    /// CRC32 over the LSN, length and payload
    pub fn compute_crc(lsn: u64, len: u32, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.to_le_bytes());
        hasher.update(&len.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }
}
