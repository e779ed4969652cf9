//! Pass-through brick.

use tracing::trace;

use crate::brick::{Brick, Subvolume};
use crate::error::BrickResult;
use crate::types::{
    Context, DirEntry, FileAttr, FileHandle, FileLock, LockCmd, OpenFlags, StatFs, Timespec,
    XattrFlags,
};

/// Forwards every operation verbatim to a single subvolume.
#[derive(Debug, Clone)]
pub struct PassBrick {
    child: Subvolume,
}

impl PassBrick {
    /// Create a pass-through brick over `child`.
    pub fn new(child: Subvolume) -> Self {
        Self { child }
    }

    /// The wrapped subvolume.
    pub fn child(&self) -> &Subvolume {
        &self.child
    }

    fn next(&self, op: &str, path: &str) -> &dyn Brick {
        trace!("pass {} {} -> {}", op, path, self.child.name());
        self.child.brick()
    }
}

impl Brick for PassBrick {
    fn getattr(&self, ctx: &Context, path: &str) -> BrickResult<FileAttr> {
        self.next("getattr", path).getattr(ctx, path)
    }

    fn readlink(&self, ctx: &Context, path: &str) -> BrickResult<String> {
        self.next("readlink", path).readlink(ctx, path)
    }

    fn mknod(&self, ctx: &Context, path: &str, mode: u32, rdev: u64) -> BrickResult<()> {
        self.next("mknod", path).mknod(ctx, path, mode, rdev)
    }

    fn mkdir(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        self.next("mkdir", path).mkdir(ctx, path, mode)
    }

    fn unlink(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        self.next("unlink", path).unlink(ctx, path)
    }

    fn rmdir(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        self.next("rmdir", path).rmdir(ctx, path)
    }

    fn symlink(&self, ctx: &Context, target: &str, link: &str) -> BrickResult<()> {
        self.next("symlink", link).symlink(ctx, target, link)
    }

    fn rename(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        self.next("rename", from).rename(ctx, from, to)
    }

    fn link(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        self.next("link", from).link(ctx, from, to)
    }

    fn chmod(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        self.next("chmod", path).chmod(ctx, path, mode)
    }

    fn chown(&self, ctx: &Context, path: &str, uid: u32, gid: u32) -> BrickResult<()> {
        self.next("chown", path).chown(ctx, path, uid, gid)
    }

    fn truncate(&self, ctx: &Context, path: &str, size: u64) -> BrickResult<()> {
        self.next("truncate", path).truncate(ctx, path, size)
    }

    fn open(&self, ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        self.next("open", path).open(ctx, path, flags)
    }

    fn read(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        self.next("read", path).read(ctx, path, fh, offset, size)
    }

    fn write(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        self.next("write", path).write(ctx, path, fh, offset, data)
    }

    fn statfs(&self, ctx: &Context, path: &str) -> BrickResult<StatFs> {
        self.next("statfs", path).statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.next("flush", path).flush(ctx, path, fh)
    }

    fn release(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.next("release", path).release(ctx, path, fh)
    }

    fn fsync(&self, ctx: &Context, path: &str, fh: FileHandle, datasync: bool) -> BrickResult<()> {
        self.next("fsync", path).fsync(ctx, path, fh, datasync)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        self.next("setxattr", path)
            .setxattr(ctx, path, name, value, flags)
    }

    fn getxattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<Vec<u8>> {
        self.next("getxattr", path).getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &str) -> BrickResult<Vec<String>> {
        self.next("listxattr", path).listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<()> {
        self.next("removexattr", path).removexattr(ctx, path, name)
    }

    fn opendir(&self, ctx: &Context, path: &str) -> BrickResult<FileHandle> {
        self.next("opendir", path).opendir(ctx, path)
    }

    fn readdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        self.next("readdir", path).readdir(ctx, path, fh, offset)
    }

    fn releasedir(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.next("releasedir", path).releasedir(ctx, path, fh)
    }

    fn fsyncdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        datasync: bool,
    ) -> BrickResult<()> {
        self.next("fsyncdir", path).fsyncdir(ctx, path, fh, datasync)
    }

    fn lock(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        self.next("lock", path).lock(ctx, path, fh, cmd, lock)
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BrickResult<()> {
        self.next("utimens", path).utimens(ctx, path, atime, mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBrick;
    use std::sync::Arc;

    fn pass_over_memory() -> (PassBrick, Arc<MemoryBrick>) {
        let mem = Arc::new(MemoryBrick::new());
        let pass = PassBrick::new(Subvolume::new("mem", mem.clone()));
        (pass, mem)
    }

    #[test]
    fn test_mutations_reach_child() {
        let (pass, mem) = pass_over_memory();
        let ctx = Context::default();
        pass.mkdir(&ctx, "/d", 0o755).unwrap();
        pass.mknod(&ctx, "/d/f", libc::S_IFREG as u32 | 0o644, 0)
            .unwrap();
        assert!(mem.getattr(&ctx, "/d").unwrap().is_dir());
        assert_eq!(mem.getattr(&ctx, "/d/f").unwrap().perm, 0o644);
    }

    #[test]
    fn test_data_path_round_trip() {
        let (pass, _mem) = pass_over_memory();
        let ctx = Context::default();
        pass.mknod(&ctx, "/f", libc::S_IFREG as u32 | 0o644, 0)
            .unwrap();
        let fh = pass.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        assert_eq!(pass.write(&ctx, "/f", fh, 0, b"hello").unwrap(), 5);
        assert_eq!(pass.read(&ctx, "/f", fh, 0, 64).unwrap(), b"hello");
        pass.release(&ctx, "/f", fh).unwrap();
    }

    #[test]
    fn test_errors_pass_through() {
        let (pass, _mem) = pass_over_memory();
        let err = pass.getattr(&Context::default(), "/missing").unwrap_err();
        assert!(err.is(libc::ENOENT));
    }
}
