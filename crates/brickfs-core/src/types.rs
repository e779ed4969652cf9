//! Value types passed across the brick interface.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque per-brick handle for an open file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHandle(pub u64);

impl FileHandle {
    /// Returns the raw handle value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Caller identity for one operation.
///
/// A context is valid for the duration of one call and is handed unchanged to
/// every subvolume that call reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    /// Caller user id.
    pub uid: u32,
    /// Caller group id.
    pub gid: u32,
    /// Caller process id.
    pub pid: u32,
}

impl Context {
    /// Create a context for the given caller.
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self { uid, gid, pid }
    }

    /// Context of the current process.
    pub fn current() -> Self {
        // SAFETY: getuid/getgid never fail and have no preconditions.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            uid,
            gid,
            pid: std::process::id(),
        }
    }
}

/// Timestamp with nanosecond precision, relative to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timespec {
    /// Whole seconds.
    pub secs: i64,
    /// Nanoseconds within the second.
    pub nsecs: u32,
}

impl Timespec {
    /// Create a timestamp.
    pub fn new(secs: i64, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for Timespec {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timespec::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Timespec::new(-(d.as_secs() as i64), 0)
                } else {
                    Timespec::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

impl From<Timespec> for SystemTime {
    fn from(t: Timespec) -> Self {
        if t.secs >= 0 {
            UNIX_EPOCH + Duration::new(t.secs as u64, t.nsecs)
        } else {
            UNIX_EPOCH - Duration::from_secs(t.secs.unsigned_abs()) + Duration::from_nanos(t.nsecs as u64)
        }
    }
}

/// Type of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file.
    RegularFile,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Named pipe.
    NamedPipe,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Unix socket.
    Socket,
}

impl FileKind {
    /// Derive the kind from the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFIFO as u32 => FileKind::NamedPipe,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn type_bits(&self) -> u32 {
        (match self {
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::NamedPipe => libc::S_IFIFO,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::Socket => libc::S_IFSOCK,
        }) as u32
    }
}

/// Attributes of a filesystem node (the `stat` of the operation interface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Inode number.
    pub ino: u64,
    /// Node type.
    pub kind: FileKind,
    /// Permission bits (`0o7777` mask), without type bits.
    pub perm: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Device id for special files.
    pub rdev: u64,
    /// Size in bytes.
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Last access time.
    pub atime: Timespec,
    /// Last modification time.
    pub mtime: Timespec,
    /// Last status change time.
    pub ctime: Timespec,
}

impl FileAttr {
    /// Full mode: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | (self.perm & 0o7777)
    }

    /// Returns true if this node is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Filesystem statistics (the `statvfs` of the operation interface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatFs {
    /// Filesystem block size.
    pub bsize: u64,
    /// Fragment size.
    pub frsize: u64,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Maximum file name length.
    pub namemax: u64,
}

/// Access mode part of the open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// `O_RDONLY`.
    ReadOnly,
    /// `O_WRONLY`.
    WriteOnly,
    /// `O_RDWR`.
    ReadWrite,
}

/// Flags passed to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFlags {
    /// Requested access mode.
    pub access: AccessMode,
    /// Remaining raw flags (`O_APPEND`, `O_TRUNC`, ...), access bits cleared.
    pub extra: i32,
}

impl OpenFlags {
    /// Read-only open.
    pub fn read_only() -> Self {
        Self {
            access: AccessMode::ReadOnly,
            extra: 0,
        }
    }

    /// Write-only open.
    pub fn write_only() -> Self {
        Self {
            access: AccessMode::WriteOnly,
            extra: 0,
        }
    }

    /// Read-write open.
    pub fn read_write() -> Self {
        Self {
            access: AccessMode::ReadWrite,
            extra: 0,
        }
    }

    /// Split raw `open(2)` flags into access mode and extra flags.
    pub fn from_raw(flags: i32) -> Self {
        let access = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::WriteOnly,
            libc::O_RDWR => AccessMode::ReadWrite,
            _ => AccessMode::ReadOnly,
        };
        Self {
            access,
            extra: flags & !libc::O_ACCMODE,
        }
    }

    /// Raw `open(2)` flags.
    pub fn to_raw(&self) -> i32 {
        let access = match self.access {
            AccessMode::ReadOnly => libc::O_RDONLY,
            AccessMode::WriteOnly => libc::O_WRONLY,
            AccessMode::ReadWrite => libc::O_RDWR,
        };
        access | self.extra
    }

    /// Add raw extra flags.
    pub fn with_extra(mut self, extra: i32) -> Self {
        self.extra |= extra & !libc::O_ACCMODE;
        self
    }

    /// Returns true for write-only and read-write opens.
    pub fn is_write_capable(&self) -> bool {
        !matches!(self.access, AccessMode::ReadOnly)
    }

    /// Returns true if the open may read.
    pub fn is_readable(&self) -> bool {
        !matches!(self.access, AccessMode::WriteOnly)
    }
}

/// One directory entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// Inode number, 0 when unknown.
    pub ino: u64,
    /// Entry type.
    pub kind: FileKind,
    /// Offset to pass to `readdir` to continue after this entry.
    pub next_offset: u64,
}

/// Behaviour of `setxattr` regarding existing attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XattrFlags {
    /// Create or replace.
    #[default]
    Either,
    /// Fail with `EEXIST` if the attribute exists.
    Create,
    /// Fail with `ENODATA` if the attribute does not exist.
    Replace,
}

impl XattrFlags {
    /// Raw `setxattr(2)` flags.
    pub fn to_raw(&self) -> i32 {
        match self {
            XattrFlags::Either => 0,
            XattrFlags::Create => libc::XATTR_CREATE,
            XattrFlags::Replace => libc::XATTR_REPLACE,
        }
    }
}

/// Kind of an advisory byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared lock (`F_RDLCK`).
    Read,
    /// Exclusive lock (`F_WRLCK`).
    Write,
    /// Release (`F_UNLCK`).
    Unlock,
}

/// Command for the `lock` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCmd {
    /// Test for a conflicting lock (`F_GETLK`).
    Get,
    /// Acquire or release without waiting (`F_SETLK`); conflicts yield `EAGAIN`.
    Set,
    /// Acquire, waiting for conflicting locks (`F_SETLKW`).
    SetWait,
}

/// An advisory byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    /// Lock kind.
    pub kind: LockKind,
    /// First byte of the range.
    pub start: u64,
    /// Length of the range; 0 means "to end of file".
    pub len: u64,
    /// Opaque lock owner. Locks with the same owner never conflict.
    pub owner: u64,
}

impl FileLock {
    /// Exclusive lock over `[start, start + len)`.
    pub fn write(start: u64, len: u64, owner: u64) -> Self {
        Self {
            kind: LockKind::Write,
            start,
            len,
            owner,
        }
    }

    /// Shared lock over `[start, start + len)`.
    pub fn read(start: u64, len: u64, owner: u64) -> Self {
        Self {
            kind: LockKind::Read,
            start,
            len,
            owner,
        }
    }

    /// The same range with kind `Unlock`.
    pub fn unlocked(&self) -> Self {
        Self {
            kind: LockKind::Unlock,
            ..*self
        }
    }

    /// Exclusive end of the range (`u64::MAX` for "to end of file").
    pub fn end(&self) -> u64 {
        if self.len == 0 {
            u64::MAX
        } else {
            self.start.saturating_add(self.len)
        }
    }

    /// Returns true if both ranges share at least one byte.
    pub fn overlaps(&self, other: &FileLock) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Returns true if `other` would be refused while `self` is held.
    pub fn conflicts_with(&self, other: &FileLock) -> bool {
        self.owner != other.owner
            && self.overlaps(other)
            && (self.kind == LockKind::Write || other.kind == LockKind::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_from_raw() {
        let flags = OpenFlags::from_raw(libc::O_RDWR | libc::O_APPEND);
        assert_eq!(flags.access, AccessMode::ReadWrite);
        assert_eq!(flags.extra, libc::O_APPEND);
        assert_eq!(flags.to_raw(), libc::O_RDWR | libc::O_APPEND);
    }

    #[test]
    fn test_write_capable() {
        assert!(!OpenFlags::read_only().is_write_capable());
        assert!(OpenFlags::write_only().is_write_capable());
        assert!(OpenFlags::read_write().is_write_capable());
        assert!(!OpenFlags::write_only().is_readable());
    }

    #[test]
    fn test_file_kind_mode_bits() {
        for kind in [
            FileKind::RegularFile,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::NamedPipe,
            FileKind::CharDevice,
            FileKind::BlockDevice,
            FileKind::Socket,
        ] {
            assert_eq!(FileKind::from_mode(kind.type_bits() | 0o644), kind);
        }
    }

    #[test]
    fn test_lock_overlap() {
        let a = FileLock::write(0, 10, 1);
        let b = FileLock::write(9, 1, 2);
        let c = FileLock::write(10, 5, 2);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_lock_zero_len_extends_to_eof() {
        let whole = FileLock::write(0, 0, 1);
        let far = FileLock::read(u64::MAX - 10, 5, 2);
        assert!(whole.conflicts_with(&far));
    }

    #[test]
    fn test_same_owner_never_conflicts() {
        let a = FileLock::write(0, 10, 7);
        let b = FileLock::write(0, 10, 7);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_shared_locks_do_not_conflict() {
        let a = FileLock::read(0, 10, 1);
        let b = FileLock::read(5, 10, 2);
        assert!(!a.conflicts_with(&b));
        assert!(a.conflicts_with(&FileLock::write(5, 1, 2)));
    }

    #[test]
    fn test_timespec_system_time_conversion() {
        let ts = Timespec::new(1_700_000_000, 123_456_789);
        let st: SystemTime = ts.into();
        assert_eq!(Timespec::from(st), ts);
    }

    #[test]
    fn test_attr_mode_combines_type_and_perm() {
        let attr = FileAttr {
            ino: 1,
            kind: FileKind::Directory,
            perm: 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: 4096,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
        };
        assert_eq!(attr.mode(), libc::S_IFDIR as u32 | 0o755);
        assert!(attr.is_dir());
    }
}
