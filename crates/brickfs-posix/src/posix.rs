//! The POSIX brick.
//!
//! Brick paths are absolute; they are joined onto the root directory after
//! dropping `.` components. A `..` component is refused with `EACCES` so a
//! caller can never step outside the root. Symlinks are stored and returned
//! verbatim and are never followed by path resolution itself.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{
    DirBuilderExt, DirEntryExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt,
    PermissionsExt,
};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use brickfs_core::{
    AccessMode, Brick, BrickError, BrickResult, Context, DirEntry, FileAttr, FileHandle,
    FileKind, FileLock, LockCmd, LockKind, LockList, OpenFlags, StatFs, Timespec, XattrFlags,
};

use crate::error::PosixError;
use crate::sys;

/// Host identity of a file: device and inode number.
type FileKey = (u64, u64);

fn err(errno: i32) -> BrickError {
    BrickError::Os(errno)
}

fn attr_of(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino: meta.ino(),
        kind: FileKind::from_mode(meta.mode()),
        perm: meta.mode() & 0o7777,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size(),
        blocks: meta.blocks(),
        blksize: meta.blksize() as u32,
        atime: Timespec::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timespec::new(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: Timespec::new(meta.ctime(), meta.ctime_nsec() as u32),
    }
}

fn kind_of(ft: fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_fifo() {
        FileKind::NamedPipe
    } else if ft.is_char_device() {
        FileKind::CharDevice
    } else if ft.is_block_device() {
        FileKind::BlockDevice
    } else if ft.is_socket() {
        FileKind::Socket
    } else {
        FileKind::RegularFile
    }
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    key: FileKey,
}

#[derive(Debug)]
struct OpenDir {
    path: PathBuf,
    entries: Vec<DirEntry>,
}

/// Brick serving a local directory tree.
pub struct PosixBrick {
    name: String,
    root: PathBuf,
    files: DashMap<FileHandle, Arc<OpenFile>>,
    dirs: DashMap<FileHandle, Arc<OpenDir>>,
    locks: Mutex<HashMap<FileKey, LockList>>,
    lock_released: Condvar,
    next_fh: AtomicU64,
}

impl PosixBrick {
    /// Create a brick serving the existing directory `root`.
    ///
    /// # Arguments
    /// * `name` - Name used in diagnostics
    /// * `root` - Directory all brick paths are resolved under
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, PosixError> {
        let name = name.into();
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|source| PosixError::Root {
            path: root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(PosixError::NotADirectory(root));
        }
        info!("posix brick {} serving {}", name, root.display());
        Ok(Self {
            name,
            root,
            files: DashMap::new(),
            dirs: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            next_fh: AtomicU64::new(1),
        })
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of open file handles.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Number of open directory handles.
    pub fn open_dirs(&self) -> usize {
        self.dirs.len()
    }

    /// Map a brick path onto the host filesystem.
    fn resolve(&self, path: &str) -> BrickResult<PathBuf> {
        if !path.starts_with('/') {
            return Err(err(libc::EINVAL));
        }
        let mut full = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => return Err(err(libc::EACCES)),
                Component::Normal(part) => full.push(part),
                Component::Prefix(_) => return Err(err(libc::EINVAL)),
            }
        }
        Ok(full)
    }

    fn alloc_fh(&self) -> FileHandle {
        FileHandle(self.next_fh.fetch_add(1, Ordering::Relaxed))
    }

    fn file(&self, fh: FileHandle) -> BrickResult<Arc<OpenFile>> {
        self.files
            .get(&fh)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| err(libc::EBADF))
    }

    fn dir(&self, fh: FileHandle) -> BrickResult<Arc<OpenDir>> {
        self.dirs
            .get(&fh)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| err(libc::EBADF))
    }

    /// Snapshot a directory listing: `.`, `..`, then children by name.
    fn list_dir(&self, full: &Path) -> BrickResult<Vec<DirEntry>> {
        let meta = fs::symlink_metadata(full)?;
        if !meta.is_dir() {
            return Err(err(libc::ENOTDIR));
        }
        let parent_ino = match full.parent() {
            Some(parent) if full != self.root => fs::metadata(parent)?.ino(),
            _ => meta.ino(),
        };

        let mut children = Vec::new();
        for entry in fs::read_dir(full)? {
            let entry = entry?;
            children.push((
                entry.file_name().to_string_lossy().into_owned(),
                entry.ino(),
                kind_of(entry.file_type()?),
            ));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let listing = [
            (".".to_string(), meta.ino(), FileKind::Directory),
            ("..".to_string(), parent_ino, FileKind::Directory),
        ]
        .into_iter()
        .chain(children)
        .enumerate()
        .map(|(idx, (name, ino, kind))| DirEntry {
            name,
            ino,
            kind,
            next_offset: idx as u64 + 1,
        })
        .collect();
        Ok(listing)
    }
}

impl std::fmt::Debug for PosixBrick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixBrick")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("open_files", &self.files.len())
            .field("open_dirs", &self.dirs.len())
            .finish()
    }
}

impl Brick for PosixBrick {
    fn getattr(&self, _ctx: &Context, path: &str) -> BrickResult<FileAttr> {
        let meta = fs::symlink_metadata(self.resolve(path)?)?;
        Ok(attr_of(&meta))
    }

    fn readlink(&self, _ctx: &Context, path: &str) -> BrickResult<String> {
        let target = fs::read_link(self.resolve(path)?)?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| err(libc::EILSEQ))
    }

    fn mknod(&self, _ctx: &Context, path: &str, mode: u32, rdev: u64) -> BrickResult<()> {
        sys::mknod(&self.resolve(path)?, mode, rdev)
    }

    fn mkdir(&self, _ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.resolve(path)?)?;
        Ok(())
    }

    fn unlink(&self, _ctx: &Context, path: &str) -> BrickResult<()> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }

    fn rmdir(&self, _ctx: &Context, path: &str) -> BrickResult<()> {
        fs::remove_dir(self.resolve(path)?)?;
        Ok(())
    }

    fn symlink(&self, _ctx: &Context, target: &str, link: &str) -> BrickResult<()> {
        std::os::unix::fs::symlink(target, self.resolve(link)?)?;
        Ok(())
    }

    fn rename(&self, _ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    fn link(&self, _ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        fs::hard_link(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    fn chmod(&self, _ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        fs::set_permissions(self.resolve(path)?, Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    fn chown(&self, _ctx: &Context, path: &str, uid: u32, gid: u32) -> BrickResult<()> {
        let keep = |id: u32| (id != u32::MAX).then_some(id);
        std::os::unix::fs::lchown(self.resolve(path)?, keep(uid), keep(gid))?;
        Ok(())
    }

    fn truncate(&self, _ctx: &Context, path: &str, size: u64) -> BrickResult<()> {
        sys::truncate(&self.resolve(path)?, size)
    }

    fn open(&self, _ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        let full = self.resolve(path)?;
        let mut opts = OpenOptions::new();
        match flags.access {
            AccessMode::ReadOnly => opts.read(true),
            AccessMode::WriteOnly => opts.write(true),
            AccessMode::ReadWrite => opts.read(true).write(true),
        };
        opts.custom_flags(flags.extra & !(libc::O_CREAT | libc::O_EXCL));
        let file = opts.open(&full)?;
        let meta = file.metadata()?;
        let fh = self.alloc_fh();
        self.files.insert(
            fh,
            Arc::new(OpenFile {
                file,
                key: (meta.dev(), meta.ino()),
            }),
        );
        debug!("{}: open {} -> {:?}", self.name, path, fh);
        Ok(fh)
    }

    fn read(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        let open = self.file(fh)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match open.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        let open = self.file(fh)?;
        Ok(open.file.write_at(data, offset)?)
    }

    fn statfs(&self, _ctx: &Context, path: &str) -> BrickResult<StatFs> {
        sys::statvfs(&self.resolve(path)?)
    }

    fn flush(&self, _ctx: &Context, _path: &str, fh: FileHandle) -> BrickResult<()> {
        self.file(fh).map(|_| ())
    }

    fn release(&self, _ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        let (_, open) = self.files.remove(&fh).ok_or_else(|| err(libc::EBADF))?;
        let mut locks = self.locks.lock();
        if let Some(list) = locks.get_mut(&open.key) {
            if list.drop_handle(fh) {
                self.lock_released.notify_all();
            }
            if list.is_empty() {
                locks.remove(&open.key);
            }
        }
        debug!("{}: release {} {:?}", self.name, path, fh);
        Ok(())
    }

    fn fsync(&self, _ctx: &Context, _path: &str, fh: FileHandle, datasync: bool) -> BrickResult<()> {
        let open = self.file(fh)?;
        if datasync {
            open.file.sync_data()?;
        } else {
            open.file.sync_all()?;
        }
        Ok(())
    }

    fn setxattr(
        &self,
        _ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        sys::lsetxattr(&self.resolve(path)?, name, value, flags.to_raw())
    }

    fn getxattr(&self, _ctx: &Context, path: &str, name: &str) -> BrickResult<Vec<u8>> {
        sys::lgetxattr(&self.resolve(path)?, name)
    }

    fn listxattr(&self, _ctx: &Context, path: &str) -> BrickResult<Vec<String>> {
        sys::llistxattr(&self.resolve(path)?)
    }

    fn removexattr(&self, _ctx: &Context, path: &str, name: &str) -> BrickResult<()> {
        sys::lremovexattr(&self.resolve(path)?, name)
    }

    fn opendir(&self, _ctx: &Context, path: &str) -> BrickResult<FileHandle> {
        let full = self.resolve(path)?;
        let entries = self.list_dir(&full)?;
        let fh = self.alloc_fh();
        self.dirs.insert(fh, Arc::new(OpenDir { path: full, entries }));
        Ok(fh)
    }

    fn readdir(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        let dir = self.dir(fh)?;
        Ok(dir
            .entries
            .iter()
            .skip(offset as usize)
            .cloned()
            .collect())
    }

    fn releasedir(&self, _ctx: &Context, _path: &str, fh: FileHandle) -> BrickResult<()> {
        self.dirs
            .remove(&fh)
            .map(|_| ())
            .ok_or_else(|| err(libc::EBADF))
    }

    fn fsyncdir(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        datasync: bool,
    ) -> BrickResult<()> {
        let dir = self.dir(fh)?;
        let handle = File::open(&dir.path)?;
        if datasync {
            handle.sync_data()?;
        } else {
            handle.sync_all()?;
        }
        Ok(())
    }

    fn lock(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        let key = self.file(fh)?.key;
        let mut locks = self.locks.lock();
        if lock.kind == LockKind::Unlock {
            if cmd == LockCmd::Get {
                return Err(err(libc::EINVAL));
            }
            if let Some(list) = locks.get_mut(&key) {
                list.carve(lock);
                if list.is_empty() {
                    locks.remove(&key);
                }
            }
            self.lock_released.notify_all();
            return Ok(None);
        }
        match cmd {
            LockCmd::Get => Ok(locks.get(&key).and_then(|list| list.first_conflict(lock))),
            LockCmd::Set => {
                let list = locks.entry(key).or_default();
                if list.first_conflict(lock).is_some() {
                    return Err(err(libc::EAGAIN));
                }
                list.insert(fh, *lock);
                Ok(None)
            }
            LockCmd::SetWait => {
                while locks
                    .get(&key)
                    .and_then(|list| list.first_conflict(lock))
                    .is_some()
                {
                    self.lock_released.wait(&mut locks);
                }
                locks.entry(key).or_default().insert(fh, *lock);
                Ok(None)
            }
        }
    }

    fn utimens(
        &self,
        _ctx: &Context,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BrickResult<()> {
        sys::utimens(&self.resolve(path)?, atime, mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brick() -> (tempfile::TempDir, PosixBrick) {
        let dir = tempfile::tempdir().unwrap();
        let brick = PosixBrick::new("test", dir.path()).unwrap();
        (dir, brick)
    }

    #[test]
    fn test_resolve_joins_under_root() {
        let (dir, brick) = brick();
        assert_eq!(brick.resolve("/").unwrap(), dir.path());
        assert_eq!(brick.resolve("/a/./b").unwrap(), dir.path().join("a/b"));
        assert_eq!(brick.resolve("//a//").unwrap(), dir.path().join("a"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (_dir, brick) = brick();
        assert!(brick.resolve("/a/../b").unwrap_err().is(libc::EACCES));
        assert!(brick.resolve("/..").unwrap_err().is(libc::EACCES));
        assert!(brick.resolve("relative").unwrap_err().is(libc::EINVAL));
    }

    #[test]
    fn test_root_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            PosixBrick::new("f", &file),
            Err(PosixError::NotADirectory(_))
        ));
        assert!(matches!(
            PosixBrick::new("m", dir.path().join("missing")),
            Err(PosixError::Root { .. })
        ));
    }

    #[test]
    fn test_kind_of_directory_and_file() {
        let (dir, _brick) = brick();
        fs::write(dir.path().join("f"), b"").unwrap();
        let file_type = fs::symlink_metadata(dir.path().join("f")).unwrap().file_type();
        assert_eq!(kind_of(file_type), FileKind::RegularFile);
        let dir_type = fs::symlink_metadata(dir.path()).unwrap().file_type();
        assert_eq!(kind_of(dir_type), FileKind::Directory);
    }
}
