//! Key layout of the index
//!
//! ```text
//! s/<sector id:32>                  → Sector
//! f/<folder id:4 BE>                → FolderRecord
//! p/<folder path>                   → folder id (4 BE)
//! m/<folder id:4 BE><sector id:32>  → (empty) folder membership
//! meta/salt                         → 32 bytes
//! meta/sector_size                  → u64 BE
//! ```

use std::path::Path;

use crate::storage::{FolderId, SectorId};

pub(crate) const SECTOR_PREFIX: &[u8] = b"s/";
pub(crate) const FOLDER_PREFIX: &[u8] = b"f/";
pub(crate) const FOLDER_PATH_PREFIX: &[u8] = b"p/";
pub(crate) const MEMBER_PREFIX: &[u8] = b"m/";
pub(crate) const SALT_KEY: &[u8] = b"meta/salt";
pub(crate) const SECTOR_SIZE_KEY: &[u8] = b"meta/sector_size";

fn prefixed(prefix: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + rest.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(rest);
    key
}

pub(crate) fn sector_key(id: &SectorId) -> Vec<u8> {
    prefixed(SECTOR_PREFIX, &id.0)
}

pub(crate) fn folder_key(id: FolderId) -> Vec<u8> {
    prefixed(FOLDER_PREFIX, &id.to_be_bytes())
}

pub(crate) fn folder_path_key(path: &Path) -> Vec<u8> {
    prefixed(FOLDER_PATH_PREFIX, path.to_string_lossy().as_bytes())
}

pub(crate) fn member_prefix(folder_id: FolderId) -> Vec<u8> {
    prefixed(MEMBER_PREFIX, &folder_id.to_be_bytes())
}

pub(crate) fn member_key(folder_id: FolderId, id: &SectorId) -> Vec<u8> {
    let mut key = member_prefix(folder_id);
    key.extend_from_slice(&id.0);
    key
}

/// Sector id from the tail of a membership key
pub(crate) fn sector_id_from_member_key(key: &[u8]) -> Option<SectorId> {
    let start = MEMBER_PREFIX.len() + 4;
    let tail = key.get(start..)?;
    let bytes: [u8; 32] = tail.try_into().ok()?;
    Some(SectorId(bytes))
}
