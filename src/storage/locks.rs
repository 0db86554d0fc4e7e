//! Per-sector locks
//!
//! A set of sector ids is locked all at once: the caller blocks until none
//! of the ids is held by anyone else, then takes them together. Taking the
//! whole set in one step means two batches can never deadlock on each
//! other, and batches over disjoint ids never wait at all.

use std::collections::{BTreeSet, HashSet};

use parking_lot::{Condvar, Mutex};

use super::SectorId;

/// Table of currently locked sector ids
#[derive(Default)]
pub struct SectorLocks {
    held: Mutex<HashSet<SectorId>>,
    released: Condvar,
}

/// Holds a set of sector locks; dropping it unlocks them
pub struct SectorLockGuard<'a> {
    locks: &'a SectorLocks,
    ids: BTreeSet<SectorId>,
}

impl SectorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every id in the set, blocking until all are free
    pub fn lock<I>(&self, ids: I) -> SectorLockGuard<'_>
    where
        I: IntoIterator<Item = SectorId>,
    {
        let ids: BTreeSet<SectorId> = ids.into_iter().collect();
        let mut held = self.held.lock();
        while ids.iter().any(|id| held.contains(id)) {
            self.released.wait(&mut held);
        }
        held.extend(ids.iter().copied());
        SectorLockGuard { locks: self, ids }
    }

    /// Lock the set only if none of it is held right now
    pub fn try_lock<I>(&self, ids: I) -> Option<SectorLockGuard<'_>>
    where
        I: IntoIterator<Item = SectorId>,
    {
        let ids: BTreeSet<SectorId> = ids.into_iter().collect();
        let mut held = self.held.lock();
        if ids.iter().any(|id| held.contains(id)) {
            return None;
        }
        held.extend(ids.iter().copied());
        Some(SectorLockGuard { locks: self, ids })
    }

    pub fn is_locked(&self, id: &SectorId) -> bool {
        self.held.lock().contains(id)
    }
}

impl SectorLockGuard<'_> {
    pub fn ids(&self) -> &BTreeSet<SectorId> {
        &self.ids
    }
}

impl Drop for SectorLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
