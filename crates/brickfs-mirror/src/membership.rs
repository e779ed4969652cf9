//! Subvolume membership tracking.
//!
//! Holds the immutable subvolume table of a mirror and the mutable active set.
//! Subvolumes only ever leave the active set (ejection); nothing rejoins for
//! the lifetime of the mirror.
//!
//! The active set sits behind its own reader-writer lock. The lock is held only
//! while flags are read or written, never across a call into a subvolume, so a
//! subvolume picked as active may be ejected by another thread before the call
//! made against it returns.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::error;

use brickfs_core::Subvolume;

use crate::error::MirrorError;

/// Stable index of a subvolume in construction order.
pub type SubvolumeId = usize;

/// Events emitted by membership changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MembershipEvent {
    /// A subvolume was ejected from the active set.
    Ejected {
        /// ID of the ejected subvolume.
        id: SubvolumeId,
        /// Name of the ejected subvolume.
        name: String,
        /// Number of subvolumes still active.
        remaining: usize,
    },
    /// The last active subvolume was ejected.
    NoneRemaining,
}

#[derive(Debug)]
struct ActiveSet {
    count: usize,
    flags: Vec<bool>,
}

/// Subvolume table plus the lock-guarded active set.
pub struct Membership {
    subvolumes: Vec<Subvolume>,
    active: RwLock<ActiveSet>,
    events: Mutex<Vec<MembershipEvent>>,
}

impl Membership {
    /// Creates a membership table with every subvolume active.
    ///
    /// # Arguments
    /// * `subvolumes` - The subvolumes, in the order that defines their ids
    ///
    /// # Returns
    /// Err if `subvolumes` is empty
    pub fn new(subvolumes: Vec<Subvolume>) -> Result<Self, MirrorError> {
        if subvolumes.is_empty() {
            return Err(MirrorError::NoSubvolumes);
        }
        let n = subvolumes.len();
        Ok(Self {
            subvolumes,
            active: RwLock::new(ActiveSet {
                count: n,
                flags: vec![true; n],
            }),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Number of configured subvolumes, active or not.
    pub fn subvolume_count(&self) -> usize {
        self.subvolumes.len()
    }

    /// Subvolume with the given id.
    ///
    /// # Panics
    /// If `id` is out of range; ids only come from this table.
    pub fn subvolume(&self, id: SubvolumeId) -> &Subvolume {
        &self.subvolumes[id]
    }

    /// Returns true if `id` is still active.
    pub fn is_active(&self, id: SubvolumeId) -> bool {
        self.active.read().flags.get(id).copied().unwrap_or(false)
    }

    /// Number of currently active subvolumes.
    pub fn active_count(&self) -> usize {
        self.active.read().count
    }

    /// Up to `max_n` active ids in ascending order.
    ///
    /// Takes the write lock so the scan and the count it is bounded by come
    /// from the same state. Returns an empty list if nothing is active.
    pub fn select_active(&self, max_n: usize) -> Vec<SubvolumeId> {
        let active = self.active.write();
        let want = max_n.min(active.count);
        active
            .flags
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(id, _)| id)
            .take(want)
            .collect()
    }

    /// Snapshot of every active id in ascending order.
    pub fn select_all_active(&self) -> Vec<SubvolumeId> {
        self.select_active(self.subvolumes.len())
    }

    /// Ejects a subvolume from the active set.
    ///
    /// Ejecting an already inactive subvolume does nothing.
    ///
    /// # Returns
    /// true if this call performed the ejection
    pub fn eject(&self, id: SubvolumeId) -> bool {
        let remaining = {
            let mut active = self.active.write();
            match active.flags.get_mut(id) {
                Some(flag) if *flag => *flag = false,
                _ => return false,
            }
            active.count -= 1;
            active.count
        };

        let name = self.subvolumes[id].name().to_string();
        error!(
            "ejecting subvolume {} ({}) after unrecoverable errors, {} active left",
            name, id, remaining
        );
        let mut events = self.events.lock();
        events.push(MembershipEvent::Ejected {
            id,
            name,
            remaining,
        });
        if remaining == 0 {
            error!("No more active subvolumes left, every call will fail from now on");
            events.push(MembershipEvent::NoneRemaining);
        }
        true
    }

    /// Take all recorded membership events.
    pub fn drain_events(&self) -> Vec<MembershipEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Copy of all recorded membership events.
    pub fn events(&self) -> Vec<MembershipEvent> {
        self.events.lock().clone()
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("subvolumes", &self.subvolumes)
            .field("active", &*self.active.read())
            .finish()
    }
}
