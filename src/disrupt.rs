//! Fault injection
//!
//! Updates call [`Disrupter::check`] at the points where a crash would leave
//! interesting on-disk state. An armed point fires once: the update aborts
//! with [`StoreError::Disrupted`] exactly where a process kill would have
//! stopped it, and the next engine open has to recover.
//!
//! A point can also be held: updates reaching it wait, with their locks
//! taken, until the [`Hold`] is dropped.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StoreError};

/// Named, one-shot fault-injection points
#[derive(Debug, Clone, Default)]
pub struct Disrupter {
    armed: Arc<Mutex<HashSet<&'static str>>>,
    holds: Arc<Holds>,
}

#[derive(Debug, Default)]
struct Holds {
    state: Mutex<HoldState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct HoldState {
    held: HashSet<&'static str>,
    /// Held points an update is currently parked at
    reached: HashSet<&'static str>,
}

/// Keeps updates parked at a point until dropped
#[must_use = "the point is released when the hold is dropped"]
pub struct Hold {
    holds: Arc<Holds>,
    point: &'static str,
}

impl Hold {
    /// Block until an update is parked at the point
    pub fn wait_until_reached(&self) {
        let mut state = self.holds.state.lock();
        while !state.reached.contains(self.point) {
            self.holds.changed.wait(&mut state);
        }
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.holds.state.lock().held.remove(self.point);
        self.holds.changed.notify_all();
    }
}

impl Disrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a point; the next `check` against it fails
    pub fn arm(&self, point: &'static str) {
        self.armed.lock().insert(point);
    }

    /// Returns true if the point is armed and has not fired yet
    pub fn is_armed(&self, point: &str) -> bool {
        self.armed.lock().contains(point)
    }

    /// Park updates at `point` until the returned hold is dropped
    pub fn hold(&self, point: &'static str) -> Hold {
        self.holds.state.lock().held.insert(point);
        Hold {
            holds: Arc::clone(&self.holds),
            point,
        }
    }

    /// Fire the point if armed, or wait while it is held
    pub fn check(&self, point: &'static str) -> Result<()> {
        if self.armed.lock().remove(point) {
            tracing::warn!(point, "disrupter fired");
            return Err(StoreError::Disrupted(point));
        }

        let mut state = self.holds.state.lock();
        if state.held.contains(point) {
            tracing::debug!(point, "parked at held point");
            state.reached.insert(point);
            self.holds.changed.notify_all();
            while state.held.contains(point) {
                self.holds.changed.wait(&mut state);
            }
            state.reached.remove(point);
        }
        Ok(())
    }
}
