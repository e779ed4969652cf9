//! The brick capability interface.
//!
//! A brick implements the uniform filesystem-operation interface below. Bricks
//! compose by holding other bricks as subvolumes and calling into them through
//! the same interface, so any brick (a mirror included) can sit beneath any
//! other.
//!
//! Every method has a default body that reports `ENOSYS`; a brick overrides
//! only the operations it supports.

use std::fmt;
use std::sync::Arc;

use crate::error::{BrickError, BrickResult};
use crate::types::{
    Context, DirEntry, FileAttr, FileHandle, FileLock, LockCmd, OpenFlags, StatFs, Timespec,
    XattrFlags,
};

/// Uniform filesystem-operation interface implemented by every brick.
///
/// Calls may block on backend I/O. Implementations must be callable from many
/// threads at once.
pub trait Brick: Send + Sync {
    /// Get attributes of the node at `path` (does not follow symlinks).
    fn getattr(&self, _ctx: &Context, _path: &str) -> BrickResult<FileAttr> {
        Err(BrickError::not_implemented())
    }

    /// Read the target of the symlink at `path`.
    fn readlink(&self, _ctx: &Context, _path: &str) -> BrickResult<String> {
        Err(BrickError::not_implemented())
    }

    /// Create a non-directory node.
    fn mknod(&self, _ctx: &Context, _path: &str, _mode: u32, _rdev: u64) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Create a directory.
    fn mkdir(&self, _ctx: &Context, _path: &str, _mode: u32) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Remove a non-directory node.
    fn unlink(&self, _ctx: &Context, _path: &str) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Remove an empty directory.
    fn rmdir(&self, _ctx: &Context, _path: &str) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Create a symlink at `link` pointing to `target`. `target` is stored verbatim.
    fn symlink(&self, _ctx: &Context, _target: &str, _link: &str) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Rename `from` to `to`, replacing `to` if it exists.
    fn rename(&self, _ctx: &Context, _from: &str, _to: &str) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Create a hard link `to` for the existing node `from`.
    fn link(&self, _ctx: &Context, _from: &str, _to: &str) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Change permission bits.
    fn chmod(&self, _ctx: &Context, _path: &str, _mode: u32) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Change owner and group.
    fn chown(&self, _ctx: &Context, _path: &str, _uid: u32, _gid: u32) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Set the file size.
    fn truncate(&self, _ctx: &Context, _path: &str, _size: u64) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Open a file and return a handle valid until `release`.
    fn open(&self, _ctx: &Context, _path: &str, _flags: OpenFlags) -> BrickResult<FileHandle> {
        Err(BrickError::not_implemented())
    }

    /// Read up to `size` bytes at `offset`. Fewer bytes means end of file.
    fn read(
        &self,
        _ctx: &Context,
        _path: &str,
        _fh: FileHandle,
        _offset: u64,
        _size: usize,
    ) -> BrickResult<Vec<u8>> {
        Err(BrickError::not_implemented())
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(
        &self,
        _ctx: &Context,
        _path: &str,
        _fh: FileHandle,
        _offset: u64,
        _data: &[u8],
    ) -> BrickResult<usize> {
        Err(BrickError::not_implemented())
    }

    /// Filesystem statistics.
    fn statfs(&self, _ctx: &Context, _path: &str) -> BrickResult<StatFs> {
        Err(BrickError::not_implemented())
    }

    /// Flush buffered state for an open file.
    fn flush(&self, _ctx: &Context, _path: &str, _fh: FileHandle) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Close an open file.
    fn release(&self, _ctx: &Context, _path: &str, _fh: FileHandle) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Synchronise an open file to stable storage.
    fn fsync(
        &self,
        _ctx: &Context,
        _path: &str,
        _fh: FileHandle,
        _datasync: bool,
    ) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Set an extended attribute.
    fn setxattr(
        &self,
        _ctx: &Context,
        _path: &str,
        _name: &str,
        _value: &[u8],
        _flags: XattrFlags,
    ) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Get an extended attribute value. A missing attribute is `ENODATA`.
    fn getxattr(&self, _ctx: &Context, _path: &str, _name: &str) -> BrickResult<Vec<u8>> {
        Err(BrickError::not_implemented())
    }

    /// List extended attribute names.
    fn listxattr(&self, _ctx: &Context, _path: &str) -> BrickResult<Vec<String>> {
        Err(BrickError::not_implemented())
    }

    /// Remove an extended attribute.
    fn removexattr(&self, _ctx: &Context, _path: &str, _name: &str) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Open a directory for listing.
    fn opendir(&self, _ctx: &Context, _path: &str) -> BrickResult<FileHandle> {
        Err(BrickError::not_implemented())
    }

    /// List directory entries starting at `offset` (0 = from the beginning).
    fn readdir(
        &self,
        _ctx: &Context,
        _path: &str,
        _fh: FileHandle,
        _offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        Err(BrickError::not_implemented())
    }

    /// Close a directory handle.
    fn releasedir(&self, _ctx: &Context, _path: &str, _fh: FileHandle) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Synchronise directory contents.
    fn fsyncdir(
        &self,
        _ctx: &Context,
        _path: &str,
        _fh: FileHandle,
        _datasync: bool,
    ) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }

    /// Test, acquire or release an advisory byte-range lock.
    ///
    /// For `LockCmd::Get` returns the first conflicting lock, if any. Setting a
    /// lock that conflicts fails with `EAGAIN`.
    fn lock(
        &self,
        _ctx: &Context,
        _path: &str,
        _fh: FileHandle,
        _cmd: LockCmd,
        _lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        Err(BrickError::not_implemented())
    }

    /// Set access and modification times.
    fn utimens(
        &self,
        _ctx: &Context,
        _path: &str,
        _atime: Timespec,
        _mtime: Timespec,
    ) -> BrickResult<()> {
        Err(BrickError::not_implemented())
    }
}

/// A brick used by another brick, plus a human-readable name for diagnostics.
#[derive(Clone)]
pub struct Subvolume {
    name: String,
    brick: Arc<dyn Brick>,
}

impl Subvolume {
    /// Wrap a brick under the given name.
    pub fn new(name: impl Into<String>, brick: Arc<dyn Brick>) -> Self {
        Self {
            name: name.into(),
            brick,
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend interface.
    pub fn brick(&self) -> &dyn Brick {
        self.brick.as_ref()
    }

    /// Shared handle to the backend.
    pub fn brick_arc(&self) -> Arc<dyn Brick> {
        Arc::clone(&self.brick)
    }
}

impl fmt::Debug for Subvolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subvolume").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl Brick for Nothing {}

    #[test]
    fn test_default_operations_report_enosys() {
        let ctx = Context::default();
        let b = Nothing;
        assert!(b.getattr(&ctx, "/").unwrap_err().is(libc::ENOSYS));
        assert!(b.mkdir(&ctx, "/d", 0o755).unwrap_err().is(libc::ENOSYS));
        assert!(b
            .open(&ctx, "/f", OpenFlags::read_only())
            .unwrap_err()
            .is(libc::ENOSYS));
        assert!(b
            .lock(&ctx, "/f", FileHandle(0), LockCmd::Set, &FileLock::write(0, 0, 1))
            .unwrap_err()
            .is(libc::ENOSYS));
    }

    #[test]
    fn test_subvolume_name_and_debug() {
        let sv = Subvolume::new("disk-a", Arc::new(Nothing));
        assert_eq!(sv.name(), "disk-a");
        assert!(format!("{:?}", sv).contains("disk-a"));
    }
}
