//! Owner-aware advisory byte-range locks held on one file.
//!
//! Conflicts are decided by lock owner, not by handle or process: two locks
//! conflict when their owners differ, their ranges overlap and at least one of
//! them is a write lock. Each held lock remembers the handle it was taken
//! through so closing that handle drops it.

use crate::types::{FileHandle, FileLock};

/// The locks currently held on one file.
#[derive(Debug, Default, Clone)]
pub struct LockList {
    held: Vec<(FileHandle, FileLock)>,
}

impl LockList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first held lock `lock` would conflict with.
    pub fn first_conflict(&self, lock: &FileLock) -> Option<FileLock> {
        self.held
            .iter()
            .map(|(_, held)| *held)
            .find(|held| held.conflicts_with(lock))
    }

    /// Remove `range` from every lock its owner holds, splitting partial
    /// overlaps.
    pub fn carve(&mut self, range: &FileLock) {
        let mut kept = Vec::with_capacity(self.held.len());
        for (fh, held) in self.held.drain(..) {
            if held.owner != range.owner || !held.overlaps(range) {
                kept.push((fh, held));
                continue;
            }
            if held.start < range.start {
                kept.push((
                    fh,
                    FileLock {
                        len: range.start - held.start,
                        ..held
                    },
                ));
            }
            if range.end() < held.end() {
                let len = if held.len == 0 {
                    0
                } else {
                    held.end() - range.end()
                };
                kept.push((
                    fh,
                    FileLock {
                        start: range.end(),
                        len,
                        ..held
                    },
                ));
            }
        }
        self.held = kept;
    }

    /// Record `lock` as held through `fh`, replacing whatever its owner held
    /// on the same range. The caller has checked for conflicts.
    pub fn insert(&mut self, fh: FileHandle, lock: FileLock) {
        self.carve(&lock);
        self.held.push((fh, lock));
    }

    /// Drop every lock taken through `fh`. Returns true if any was held.
    pub fn drop_handle(&mut self, fh: FileHandle) -> bool {
        let before = self.held.len();
        self.held.retain(|(holder, _)| *holder != fh);
        self.held.len() != before
    }

    /// Number of held lock ranges.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Returns true if nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_owner_never_conflicts() {
        let mut list = LockList::new();
        list.insert(FileHandle(1), FileLock::write(0, 10, 7));
        assert!(list.first_conflict(&FileLock::write(5, 1, 7)).is_none());
        assert!(list.first_conflict(&FileLock::read(5, 1, 8)).is_some());
    }

    #[test]
    fn test_readers_share() {
        let mut list = LockList::new();
        list.insert(FileHandle(1), FileLock::read(0, 0, 1));
        assert!(list.first_conflict(&FileLock::read(100, 5, 2)).is_none());
        assert!(list.first_conflict(&FileLock::write(100, 5, 2)).is_some());
    }

    #[test]
    fn test_carve_splits_middle() {
        let mut list = LockList::new();
        list.insert(FileHandle(1), FileLock::write(0, 10, 1));
        list.carve(&FileLock::write(3, 2, 1).unlocked());
        assert_eq!(list.len(), 2);
        assert!(list.first_conflict(&FileLock::write(3, 2, 2)).is_none());
        assert!(list.first_conflict(&FileLock::write(2, 1, 2)).is_some());
        assert!(list.first_conflict(&FileLock::write(5, 1, 2)).is_some());
    }

    #[test]
    fn test_carve_keeps_open_ended_tail() {
        let mut list = LockList::new();
        list.insert(FileHandle(1), FileLock::write(0, 0, 1));
        list.carve(&FileLock::write(0, 100, 1));
        assert_eq!(list.len(), 1);
        assert!(list.first_conflict(&FileLock::write(1 << 40, 1, 2)).is_some());
    }

    #[test]
    fn test_drop_handle() {
        let mut list = LockList::new();
        list.insert(FileHandle(1), FileLock::write(0, 1, 1));
        list.insert(FileHandle(2), FileLock::write(5, 1, 2));
        assert!(list.drop_handle(FileHandle(1)));
        assert!(!list.drop_handle(FileHandle(1)));
        assert_eq!(list.len(), 1);
        assert!(!list.is_empty());
    }
}
