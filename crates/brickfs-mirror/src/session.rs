//! Open-file and open-directory sessions.
//!
//! A session binds one logical open of the mirror to the native handles its
//! subvolumes returned. Read-only opens and directory opens are bound to a
//! single subvolume; write-capable opens hold one entry per subvolume that was
//! active when the file was opened.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use brickfs_core::{BrickError, BrickResult, FileHandle};

use crate::membership::SubvolumeId;

/// One `(subvolume, native handle)` binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    /// Subvolume the handle belongs to.
    pub subvolume: SubvolumeId,
    /// Handle returned by that subvolume's `open`/`opendir`.
    pub handle: FileHandle,
}

impl SessionEntry {
    /// Create a binding.
    pub fn new(subvolume: SubvolumeId, handle: FileHandle) -> Self {
        Self { subvolume, handle }
    }
}

/// State of one open file, owned by the caller between open and release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSession {
    /// Read-only open, bound to exactly one subvolume.
    Read(SessionEntry),
    /// Write-capable open, bound to every subvolume active at open time.
    Write(Vec<SessionEntry>),
}

impl FileSession {
    /// All bindings in subvolume order.
    pub fn entries(&self) -> &[SessionEntry] {
        match self {
            FileSession::Read(entry) => std::slice::from_ref(entry),
            FileSession::Write(entries) => entries,
        }
    }
}

/// State of one open directory, bound to a single subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSession {
    /// The bound subvolume and its native handle.
    pub entry: SessionEntry,
}

/// Maps the handles a mirror hands upward to the sessions behind them.
///
/// Sessions are copied out (or removed) before any subvolume call so no map
/// shard stays locked across backend I/O.
#[derive(Debug)]
pub struct HandleTable<S> {
    sessions: DashMap<FileHandle, S>,
    next: AtomicU64,
}

impl<S: Clone> HandleTable<S> {
    /// Create an empty table. Handles start at 1.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Store a session and return the handle naming it.
    pub fn insert(&self, session: S) -> FileHandle {
        let fh = FileHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(fh, session);
        fh
    }

    /// Copy of the session behind `fh`; `EBADF` if unknown.
    pub fn get(&self, fh: FileHandle) -> BrickResult<S> {
        self.sessions
            .get(&fh)
            .map(|s| s.value().clone())
            .ok_or(BrickError::Os(libc::EBADF))
    }

    /// Remove and return the session behind `fh`; `EBADF` if unknown.
    pub fn remove(&self, fh: FileHandle) -> BrickResult<S> {
        self.sessions
            .remove(&fh)
            .map(|(_, s)| s)
            .ok_or(BrickError::Os(libc::EBADF))
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<S: Clone> Default for HandleTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_session_has_one_entry() {
        let s = FileSession::Read(SessionEntry::new(2, FileHandle(9)));
        assert_eq!(s.entries(), &[SessionEntry::new(2, FileHandle(9))]);
    }

    #[test]
    fn test_write_session_keeps_order() {
        let s = FileSession::Write(vec![
            SessionEntry::new(0, FileHandle(5)),
            SessionEntry::new(2, FileHandle(1)),
        ]);
        let ids: Vec<_> = s.entries().iter().map(|e| e.subvolume).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_handle_table_lifecycle() {
        let table: HandleTable<DirSession> = HandleTable::new();
        let session = DirSession {
            entry: SessionEntry::new(0, FileHandle(3)),
        };
        let a = table.insert(session);
        let b = table.insert(session);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).unwrap(), session);
        table.remove(a).unwrap();
        assert!(table.get(a).unwrap_err().is(libc::EBADF));
        assert!(table.remove(a).unwrap_err().is(libc::EBADF));
        assert_eq!(table.len(), 1);
    }
}
