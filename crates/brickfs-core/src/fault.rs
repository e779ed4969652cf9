//! Fault-injecting brick.
//!
//! Wraps another brick and fails selected operations with a chosen errno
//! before they reach it. Every call is recorded, so tests can assert exactly
//! which operations a layer above performed (or did not perform).

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::brick::Brick;
use crate::error::{BrickError, BrickResult};
use crate::types::{
    Context, DirEntry, FileAttr, FileHandle, FileLock, LockCmd, OpenFlags, StatFs, Timespec,
    XattrFlags,
};

/// Operation names of the brick interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `getattr`
    Getattr,
    /// `readlink`
    Readlink,
    /// `mknod`
    Mknod,
    /// `mkdir`
    Mkdir,
    /// `unlink`
    Unlink,
    /// `rmdir`
    Rmdir,
    /// `symlink`
    Symlink,
    /// `rename`
    Rename,
    /// `link`
    Link,
    /// `chmod`
    Chmod,
    /// `chown`
    Chown,
    /// `truncate`
    Truncate,
    /// `open`
    Open,
    /// `read`
    Read,
    /// `write`
    Write,
    /// `statfs`
    Statfs,
    /// `flush`
    Flush,
    /// `release`
    Release,
    /// `fsync`
    Fsync,
    /// `setxattr`
    Setxattr,
    /// `getxattr`
    Getxattr,
    /// `listxattr`
    Listxattr,
    /// `removexattr`
    Removexattr,
    /// `opendir`
    Opendir,
    /// `readdir`
    Readdir,
    /// `releasedir`
    Releasedir,
    /// `fsyncdir`
    Fsyncdir,
    /// `lock`
    Lock,
    /// `utimens`
    Utimens,
}

impl Op {
    /// Lowercase operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Getattr => "getattr",
            Op::Readlink => "readlink",
            Op::Mknod => "mknod",
            Op::Mkdir => "mkdir",
            Op::Unlink => "unlink",
            Op::Rmdir => "rmdir",
            Op::Symlink => "symlink",
            Op::Rename => "rename",
            Op::Link => "link",
            Op::Chmod => "chmod",
            Op::Chown => "chown",
            Op::Truncate => "truncate",
            Op::Open => "open",
            Op::Read => "read",
            Op::Write => "write",
            Op::Statfs => "statfs",
            Op::Flush => "flush",
            Op::Release => "release",
            Op::Fsync => "fsync",
            Op::Setxattr => "setxattr",
            Op::Getxattr => "getxattr",
            Op::Listxattr => "listxattr",
            Op::Removexattr => "removexattr",
            Op::Opendir => "opendir",
            Op::Readdir => "readdir",
            Op::Releasedir => "releasedir",
            Op::Fsyncdir => "fsyncdir",
            Op::Lock => "lock",
            Op::Utimens => "utimens",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRule {
    /// Operation to fail.
    pub op: Op,
    /// Only fail calls on this path (the first path argument).
    pub path: Option<String>,
    /// Errno to report.
    pub errno: i32,
    /// Remaining firings; `None` fires forever.
    pub remaining: Option<u32>,
    /// Matching calls still let through before the rule starts firing.
    pub skip: u32,
}

impl FaultRule {
    /// A rule failing every call of `op` with `errno`.
    pub fn new(op: Op, errno: i32) -> Self {
        Self {
            op,
            path: None,
            errno,
            remaining: None,
            skip: 0,
        }
    }

    /// Restrict the rule to one path.
    pub fn on_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Fire only `n` times.
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    /// Fire only once.
    pub fn once(self) -> Self {
        self.times(1)
    }

    /// Let the first `n` matching calls succeed.
    pub fn after(mut self, n: u32) -> Self {
        self.skip = n;
        self
    }

    fn matches(&self, op: Op, path: &str) -> bool {
        self.op == op
            && self.remaining != Some(0)
            && self.path.as_deref().map_or(true, |p| p == path)
    }
}

#[derive(Debug, Default)]
struct FaultState {
    rules: Vec<FaultRule>,
    calls: Vec<(Op, String)>,
}

/// Brick wrapper that injects failures and records calls.
pub struct FaultyBrick {
    inner: Arc<dyn Brick>,
    state: Mutex<FaultState>,
}

impl FaultyBrick {
    /// Wrap `inner` with no rules installed.
    pub fn new(inner: Arc<dyn Brick>) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    /// Install a rule. Rules are consulted in insertion order.
    pub fn add_rule(&self, rule: FaultRule) {
        self.state.lock().rules.push(rule);
    }

    /// Fail every call of `op` with `errno`.
    pub fn fail(&self, op: Op, errno: i32) {
        self.add_rule(FaultRule::new(op, errno));
    }

    /// Fail the next call of `op` with `errno`.
    pub fn fail_once(&self, op: Op, errno: i32) {
        self.add_rule(FaultRule::new(op, errno).once());
    }

    /// Remove every rule.
    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    /// Every call seen so far, in order, with its first path argument.
    pub fn calls(&self) -> Vec<(Op, String)> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op` seen so far.
    pub fn count(&self, op: Op) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(called, _)| *called == op)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// The wrapped brick.
    pub fn inner(&self) -> &dyn Brick {
        self.inner.as_ref()
    }

    fn check(&self, op: Op, path: &str) -> BrickResult<&dyn Brick> {
        let mut state = self.state.lock();
        state.calls.push((op, path.to_string()));
        if let Some(rule) = state.rules.iter_mut().find(|r| r.matches(op, path)) {
            if rule.skip > 0 {
                rule.skip -= 1;
                return Ok(self.inner.as_ref());
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            debug!("injecting errno {} into {} {}", rule.errno, op, path);
            return Err(BrickError::from_errno(rule.errno));
        }
        Ok(self.inner.as_ref())
    }
}

impl fmt::Debug for FaultyBrick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyBrick")
            .field("rules", &self.state.lock().rules)
            .finish()
    }
}

impl Brick for FaultyBrick {
    fn getattr(&self, ctx: &Context, path: &str) -> BrickResult<FileAttr> {
        self.check(Op::Getattr, path)?.getattr(ctx, path)
    }

    fn readlink(&self, ctx: &Context, path: &str) -> BrickResult<String> {
        self.check(Op::Readlink, path)?.readlink(ctx, path)
    }

    fn mknod(&self, ctx: &Context, path: &str, mode: u32, rdev: u64) -> BrickResult<()> {
        self.check(Op::Mknod, path)?.mknod(ctx, path, mode, rdev)
    }

    fn mkdir(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        self.check(Op::Mkdir, path)?.mkdir(ctx, path, mode)
    }

    fn unlink(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        self.check(Op::Unlink, path)?.unlink(ctx, path)
    }

    fn rmdir(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        self.check(Op::Rmdir, path)?.rmdir(ctx, path)
    }

    fn symlink(&self, ctx: &Context, target: &str, link: &str) -> BrickResult<()> {
        self.check(Op::Symlink, link)?.symlink(ctx, target, link)
    }

    fn rename(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        self.check(Op::Rename, from)?.rename(ctx, from, to)
    }

    fn link(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        self.check(Op::Link, to)?.link(ctx, from, to)
    }

    fn chmod(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        self.check(Op::Chmod, path)?.chmod(ctx, path, mode)
    }

    fn chown(&self, ctx: &Context, path: &str, uid: u32, gid: u32) -> BrickResult<()> {
        self.check(Op::Chown, path)?.chown(ctx, path, uid, gid)
    }

    fn truncate(&self, ctx: &Context, path: &str, size: u64) -> BrickResult<()> {
        self.check(Op::Truncate, path)?.truncate(ctx, path, size)
    }

    fn open(&self, ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        self.check(Op::Open, path)?.open(ctx, path, flags)
    }

    fn read(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        self.check(Op::Read, path)?.read(ctx, path, fh, offset, size)
    }

    fn write(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        self.check(Op::Write, path)?.write(ctx, path, fh, offset, data)
    }

    fn statfs(&self, ctx: &Context, path: &str) -> BrickResult<StatFs> {
        self.check(Op::Statfs, path)?.statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.check(Op::Flush, path)?.flush(ctx, path, fh)
    }

    fn release(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.check(Op::Release, path)?.release(ctx, path, fh)
    }

    fn fsync(&self, ctx: &Context, path: &str, fh: FileHandle, datasync: bool) -> BrickResult<()> {
        self.check(Op::Fsync, path)?.fsync(ctx, path, fh, datasync)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        self.check(Op::Setxattr, path)?
            .setxattr(ctx, path, name, value, flags)
    }

    fn getxattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<Vec<u8>> {
        self.check(Op::Getxattr, path)?.getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &str) -> BrickResult<Vec<String>> {
        self.check(Op::Listxattr, path)?.listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<()> {
        self.check(Op::Removexattr, path)?
            .removexattr(ctx, path, name)
    }

    fn opendir(&self, ctx: &Context, path: &str) -> BrickResult<FileHandle> {
        self.check(Op::Opendir, path)?.opendir(ctx, path)
    }

    fn readdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        self.check(Op::Readdir, path)?.readdir(ctx, path, fh, offset)
    }

    fn releasedir(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.check(Op::Releasedir, path)?.releasedir(ctx, path, fh)
    }

    fn fsyncdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        datasync: bool,
    ) -> BrickResult<()> {
        self.check(Op::Fsyncdir, path)?
            .fsyncdir(ctx, path, fh, datasync)
    }

    fn lock(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        self.check(Op::Lock, path)?.lock(ctx, path, fh, cmd, lock)
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BrickResult<()> {
        self.check(Op::Utimens, path)?
            .utimens(ctx, path, atime, mtime)
    }
}
