//! Sector identifiers and records

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identifier of a storage folder
pub type FolderId = u32;

/// Content root of a sector: the blake3 hash of its bytes
///
/// This is the handle collaborators hold.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorRoot(pub [u8; 32]);

impl SectorRoot {
    pub fn from_content(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorRoot({})", self.to_hex())
    }
}

impl FromStr for SectorRoot {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| StoreError::InvalidInput(format!("bad sector root {:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

/// Storage key of a sector: the root hashed with the per-host salt
///
/// Keeps on-disk keys unpredictable to clients who only know roots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorId(pub [u8; 32]);

impl SectorId {
    pub fn derive(salt: &[u8; 32], root: &SectorRoot) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt);
        hasher.update(&root.0);
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorId({})", hex::encode(&self.0[..8]))
    }
}

/// Index row of a stored sector
///
/// `count` is the reference count. The row exists only while `count > 0`;
/// references beyond the first share the one physical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub id: SectorId,
    pub folder_id: FolderId,
    pub index: u64,
    pub count: u64,
}

/// Where a sector lives, with its count at that moment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorLocation {
    pub folder_id: FolderId,
    pub index: u64,
    pub count: u64,
}

impl Sector {
    pub fn location(&self) -> SectorLocation {
        SectorLocation {
            folder_id: self.folder_id,
            index: self.index,
            count: self.count,
        }
    }

    pub fn at(id: SectorId, location: SectorLocation) -> Self {
        Self {
            id,
            folder_id: location.folder_id,
            index: location.index,
            count: location.count,
        }
    }
}
