//! The cache brick.
//!
//! The cache subvolume mirrors the origin's namespace with placeholder nodes:
//! directories as directories, symlinks as symlinks with the origin's target,
//! everything else as empty regular files. Each placeholder may carry an
//! [`AttrRecord`] in the [`STAT_XATTR`] attribute. A record, once stored, is
//! trusted until a mutation through this brick refreshes or drops it; changes
//! made to the origin behind this brick's back are not noticed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use brickfs_core::{
    Brick, BrickResult, Context, DirEntry, FileAttr, FileHandle, FileKind, FileLock, LockCmd,
    OpenFlags, StatFs, Subvolume, Timespec, XattrFlags,
};

use crate::record::{AttrRecord, STAT_XATTR};

const PLACEHOLDER_PERM: u32 = 0o600;
const PLACEHOLDER_DIR_PERM: u32 = 0o700;

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Point-in-time counters of one cache brick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that went to the origin.
    pub misses: u64,
    /// Records or placeholders dropped after a mutation.
    pub invalidations: u64,
    /// Failed cache updates.
    pub cache_errors: u64,
}

#[derive(Debug, Default)]
struct CacheStatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    cache_errors: AtomicU64,
}

impl CacheStatsInner {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
        }
    }
}

/// Brick answering metadata lookups of `origin` from `cache`.
#[derive(Debug)]
pub struct CacheBrick {
    origin: Subvolume,
    cache: Subvolume,
    stats: CacheStatsInner,
}

impl CacheBrick {
    /// Cache the metadata of `origin` in `cache`.
    pub fn new(origin: Subvolume, cache: Subvolume) -> Self {
        debug!(
            "caching {} in {}",
            origin.name(),
            cache.name()
        );
        Self {
            origin,
            cache,
            stats: CacheStatsInner::default(),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn origin_brick(&self) -> &dyn Brick {
        self.origin.brick()
    }

    fn cache_brick(&self) -> &dyn Brick {
        self.cache.brick()
    }

    fn cache_failed(&self, what: &str, path: &str, e: impl std::fmt::Display) {
        info!("Error while caching {} of {}: {}", what, path, e);
        CacheStatsInner::bump(&self.stats.cache_errors);
    }

    /// The stored record for `path`, if any. Unreadable records are dropped.
    fn cached_attr(&self, ctx: &Context, path: &str) -> Option<FileAttr> {
        let bytes = self.cache_brick().getxattr(ctx, path, STAT_XATTR).ok()?;
        match AttrRecord::decode(&bytes) {
            Ok(record) => Some(record.attr),
            Err(e) => {
                warn!("dropping unreadable attribute record of {}: {}", path, e);
                self.invalidate(ctx, path);
                None
            }
        }
    }

    /// Create the cache directories leading to `path`.
    fn ensure_parents(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            prefix.push('/');
            prefix.push_str(part);
            match self
                .cache_brick()
                .mkdir(ctx, &prefix, PLACEHOLDER_DIR_PERM)
            {
                Err(e) if !e.is(libc::EEXIST) => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Create a placeholder matching the kind of `attr`.
    fn create_placeholder(&self, ctx: &Context, path: &str, attr: &FileAttr) -> BrickResult<()> {
        self.ensure_parents(ctx, path)?;
        let cache = self.cache_brick();
        match attr.kind {
            FileKind::Directory => cache.mkdir(ctx, path, PLACEHOLDER_DIR_PERM),
            FileKind::Symlink => {
                let target = self.origin_brick().readlink(ctx, path)?;
                cache.symlink(ctx, &target, path)
            }
            _ => cache.mknod(
                ctx,
                path,
                libc::S_IFREG as u32 | PLACEHOLDER_PERM,
                0,
            ),
        }
    }

    /// Store `attr` as the record of `path`, creating the placeholder if needed.
    fn store(&self, ctx: &Context, path: &str, attr: &FileAttr) {
        let bytes = match AttrRecord::new(attr.clone()).encode() {
            Ok(bytes) => bytes,
            Err(e) => return self.cache_failed("metadata", path, e),
        };
        let cache = self.cache_brick();
        let result = match cache.setxattr(ctx, path, STAT_XATTR, &bytes, XattrFlags::Either) {
            Err(e) if e.is(libc::ENOENT) => self
                .create_placeholder(ctx, path, attr)
                .and_then(|()| cache.setxattr(ctx, path, STAT_XATTR, &bytes, XattrFlags::Either)),
            other => other,
        };
        if let Err(e) = result {
            if e.is(libc::ENOTSUP) {
                info!("Caching enabled but extended attributes not supported.");
                CacheStatsInner::bump(&self.stats.cache_errors);
            } else {
                self.cache_failed("metadata", path, e);
            }
        }
    }

    /// Fetch fresh attributes from the origin and store them.
    fn refresh(&self, ctx: &Context, path: &str) {
        match self.origin_brick().getattr(ctx, path) {
            Ok(attr) => self.store(ctx, path, &attr),
            Err(_) => self.invalidate(ctx, path),
        }
    }

    /// Drop the record of `path`; the placeholder stays.
    fn invalidate(&self, ctx: &Context, path: &str) {
        match self.cache_brick().removexattr(ctx, path, STAT_XATTR) {
            Ok(()) => CacheStatsInner::bump(&self.stats.invalidations),
            Err(e) if e.is(libc::ENOENT) || e.is(libc::ENODATA) => {}
            Err(e) => self.cache_failed("invalidation", path, e),
        }
    }

    /// Remove the placeholder of `path`, whatever its kind.
    fn evict(&self, ctx: &Context, path: &str) {
        let cache = self.cache_brick();
        let result = match cache.unlink(ctx, path) {
            Err(e) if e.is(libc::EISDIR) || e.is(libc::EPERM) => cache.rmdir(ctx, path),
            other => other,
        };
        match result {
            Ok(()) => CacheStatsInner::bump(&self.stats.invalidations),
            Err(e) if e.is(libc::ENOENT) => {}
            Err(e) => {
                error!("Corrupt cache: {} could not be removed: {}", path, e);
                CacheStatsInner::bump(&self.stats.cache_errors);
            }
        }
    }
}

impl Brick for CacheBrick {
    fn getattr(&self, ctx: &Context, path: &str) -> BrickResult<FileAttr> {
        if let Some(attr) = self.cached_attr(ctx, path) {
            CacheStatsInner::bump(&self.stats.hits);
            return Ok(attr);
        }
        CacheStatsInner::bump(&self.stats.misses);
        let attr = self.origin_brick().getattr(ctx, path)?;
        self.store(ctx, path, &attr);
        Ok(attr)
    }

    fn readlink(&self, ctx: &Context, path: &str) -> BrickResult<String> {
        match self.cache_brick().readlink(ctx, path) {
            Ok(target) => {
                CacheStatsInner::bump(&self.stats.hits);
                return Ok(target);
            }
            // A placeholder of another kind sits where the symlink should be.
            Err(e) if e.is(libc::EINVAL) => self.evict(ctx, path),
            Err(_) => {}
        }
        CacheStatsInner::bump(&self.stats.misses);
        let target = self.origin_brick().readlink(ctx, path)?;
        if let Err(e) = self
            .ensure_parents(ctx, path)
            .and_then(|()| self.cache_brick().symlink(ctx, &target, path))
        {
            self.cache_failed("symlink", path, e);
        }
        Ok(target)
    }

    fn mknod(&self, ctx: &Context, path: &str, mode: u32, rdev: u64) -> BrickResult<()> {
        self.origin_brick().mknod(ctx, path, mode, rdev)?;
        self.invalidate(ctx, parent_of(path));
        // Without a cached parent the placeholder is created on first lookup.
        match self.cache_brick().mknod(
            ctx,
            path,
            libc::S_IFREG as u32 | PLACEHOLDER_PERM,
            0,
        ) {
            Err(e) if !e.is(libc::ENOENT) => self.cache_failed("new node", path, e),
            _ => {}
        }
        Ok(())
    }

    fn mkdir(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        self.origin_brick().mkdir(ctx, path, mode)?;
        self.invalidate(ctx, parent_of(path));
        Ok(())
    }

    fn unlink(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        self.origin_brick().unlink(ctx, path)?;
        self.evict(ctx, path);
        self.invalidate(ctx, parent_of(path));
        Ok(())
    }

    fn rmdir(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        self.origin_brick().rmdir(ctx, path)?;
        self.evict(ctx, path);
        self.invalidate(ctx, parent_of(path));
        Ok(())
    }

    fn symlink(&self, ctx: &Context, target: &str, link: &str) -> BrickResult<()> {
        self.origin_brick().symlink(ctx, target, link)?;
        self.invalidate(ctx, parent_of(link));
        match self.cache_brick().symlink(ctx, target, link) {
            Err(e) if !e.is(libc::ENOENT) => self.cache_failed("symlink", link, e),
            _ => {}
        }
        Ok(())
    }

    fn rename(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        self.origin_brick().rename(ctx, from, to)?;
        match self.cache_brick().rename(ctx, from, to) {
            Ok(()) => self.invalidate(ctx, to),
            Err(e) if e.is(libc::ENOENT) => self.evict(ctx, to),
            Err(e) => {
                self.cache_failed("rename", from, e);
                self.evict(ctx, from);
                self.evict(ctx, to);
            }
        }
        self.invalidate(ctx, parent_of(from));
        self.invalidate(ctx, parent_of(to));
        Ok(())
    }

    fn link(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        self.origin_brick().link(ctx, from, to)?;
        self.invalidate(ctx, from);
        self.invalidate(ctx, parent_of(to));
        match self.cache_brick().link(ctx, from, to) {
            Ok(()) => {}
            Err(e) if e.is(libc::ENOENT) => {}
            Err(e) => self.cache_failed("hard link", to, e),
        }
        Ok(())
    }

    fn chmod(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        self.origin_brick().chmod(ctx, path, mode)?;
        self.refresh(ctx, path);
        Ok(())
    }

    fn chown(&self, ctx: &Context, path: &str, uid: u32, gid: u32) -> BrickResult<()> {
        self.origin_brick().chown(ctx, path, uid, gid)?;
        self.refresh(ctx, path);
        Ok(())
    }

    fn truncate(&self, ctx: &Context, path: &str, size: u64) -> BrickResult<()> {
        self.origin_brick().truncate(ctx, path, size)?;
        self.refresh(ctx, path);
        Ok(())
    }

    fn open(&self, ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        let fh = self.origin_brick().open(ctx, path, flags)?;
        if flags.extra & libc::O_TRUNC != 0 {
            self.invalidate(ctx, path);
        }
        Ok(fh)
    }

    fn read(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        self.origin_brick().read(ctx, path, fh, offset, size)
    }

    fn write(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        let written = self.origin_brick().write(ctx, path, fh, offset, data)?;
        self.invalidate(ctx, path);
        Ok(written)
    }

    fn statfs(&self, ctx: &Context, path: &str) -> BrickResult<StatFs> {
        self.origin_brick().statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.origin_brick().flush(ctx, path, fh)
    }

    fn release(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.origin_brick().release(ctx, path, fh)
    }

    fn fsync(&self, ctx: &Context, path: &str, fh: FileHandle, datasync: bool) -> BrickResult<()> {
        self.origin_brick().fsync(ctx, path, fh, datasync)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        self.origin_brick().setxattr(ctx, path, name, value, flags)?;
        self.invalidate(ctx, path);
        Ok(())
    }

    fn getxattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<Vec<u8>> {
        self.origin_brick().getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &str) -> BrickResult<Vec<String>> {
        self.origin_brick().listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<()> {
        self.origin_brick().removexattr(ctx, path, name)?;
        self.invalidate(ctx, path);
        Ok(())
    }

    fn opendir(&self, ctx: &Context, path: &str) -> BrickResult<FileHandle> {
        self.origin_brick().opendir(ctx, path)
    }

    fn readdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        self.origin_brick().readdir(ctx, path, fh, offset)
    }

    fn releasedir(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.origin_brick().releasedir(ctx, path, fh)
    }

    fn fsyncdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        datasync: bool,
    ) -> BrickResult<()> {
        self.origin_brick().fsyncdir(ctx, path, fh, datasync)
    }

    fn lock(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        self.origin_brick().lock(ctx, path, fh, cmd, lock)
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BrickResult<()> {
        self.origin_brick().utimens(ctx, path, atime, mtime)?;
        self.refresh(ctx, path);
        Ok(())
    }
}
