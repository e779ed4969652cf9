//! The mirror brick.
//!
//! Every mutation is fanned out to a snapshot of the active subvolumes, taken
//! once when the call starts. The first subvolume of a snapshot is
//! authoritative: when it fails, the call fails with its error and nothing has
//! changed anywhere. Failures further along are undone or contained according
//! to the operation class:
//!
//! * creations (`mknod`, `mkdir`, `symlink`, `link`, `rename`) are undone on
//!   every subvolume that already succeeded, using the inverse operation;
//! * removals and `truncate` cannot be undone, so the failing subvolume is
//!   ejected and the call continues;
//! * attribute and content changes (`chmod`, `chown`, `utimens`, `setxattr`,
//!   `removexattr`, `write`) restore a backup taken before the change, or eject
//!   the failing subvolume when no backup could be taken.
//!
//! A compensating call that fails ejects the subvolume it failed on. Reads are
//! served by the first active subvolume, without cross-checking the others.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use brickfs_core::{
    Brick, BrickError, BrickResult, Context, DirEntry, FileAttr, FileHandle, FileLock, LockCmd,
    OpenFlags, StatFs, Subvolume, Timespec, XattrFlags,
};

use crate::backup::{ensure_lock, XattrBackup};
use crate::error::{MirrorError, RollbackFailure};
use crate::membership::{Membership, MembershipEvent, SubvolumeId};
use crate::session::{DirSession, FileSession, HandleTable, SessionEntry};
use crate::stats::{MirrorStats, MirrorStatsInner};

static NEXT_LOCK_OWNER: AtomicU64 = AtomicU64::new(1);
const LOCK_OWNER_TAG: u64 = 0x6d69_7272_0000_0000;

/// A unit a fan-out is applied to: a bare subvolume, or a session binding.
trait Target: Copy {
    fn subvolume(&self) -> SubvolumeId;
}

impl Target for SubvolumeId {
    fn subvolume(&self) -> SubvolumeId {
        *self
    }
}

impl Target for SessionEntry {
    fn subvolume(&self) -> SubvolumeId {
        self.subvolume
    }
}

/// A lock owner no other backup lock shares, so concurrent backups of one
/// range conflict instead of merging.
fn backup_lock_owner() -> u64 {
    LOCK_OWNER_TAG | NEXT_LOCK_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Write all of `data` or fail; a short write counts as `EIO`.
fn write_all(
    brick: &dyn Brick,
    ctx: &Context,
    path: &str,
    fh: FileHandle,
    offset: u64,
    data: &[u8],
) -> BrickResult<()> {
    let written = brick.write(ctx, path, fh, offset, data)?;
    if written != data.len() {
        return Err(BrickError::Os(libc::EIO));
    }
    Ok(())
}

/// Brick that replicates every operation over N subvolumes.
pub struct MirrorBrick {
    name: String,
    membership: Membership,
    files: HandleTable<FileSession>,
    dirs: HandleTable<DirSession>,
    stats: MirrorStatsInner,
}

impl MirrorBrick {
    /// Create a mirror over `subvolumes`, all initially active.
    ///
    /// Subvolume ids follow the order of `subvolumes`. At least one subvolume
    /// is required.
    pub fn new(name: impl Into<String>, subvolumes: Vec<Subvolume>) -> Result<Self, MirrorError> {
        let membership = Membership::new(subvolumes)?;
        let name = name.into();
        debug!(
            "mirror {} over {} subvolumes",
            name,
            membership.subvolume_count()
        );
        Ok(Self {
            name,
            membership,
            files: HandleTable::new(),
            dirs: HandleTable::new(),
            stats: MirrorStatsInner::default(),
        })
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The membership table.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Current counters.
    pub fn stats(&self) -> MirrorStats {
        self.stats.snapshot(
            self.membership.active_count(),
            self.membership.subvolume_count(),
        )
    }

    /// Take all membership events recorded so far.
    pub fn drain_events(&self) -> Vec<MembershipEvent> {
        self.membership.drain_events()
    }

    /// Number of files open through the handle-based interface.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Number of directories open through the handle-based interface.
    pub fn open_dirs(&self) -> usize {
        self.dirs.len()
    }

    fn eject(&self, id: SubvolumeId) {
        if self.membership.eject(id) {
            MirrorStatsInner::bump(&self.stats.ejections);
        }
    }

    /// The subvolume serving read-class calls.
    fn reader_id(&self) -> BrickResult<SubvolumeId> {
        self.membership
            .select_active(1)
            .first()
            .copied()
            .ok_or(BrickError::NoActiveSubvolumes)
    }

    fn reader(&self) -> BrickResult<&Subvolume> {
        Ok(self.membership.subvolume(self.reader_id()?))
    }

    /// Active-set snapshot for one mutation.
    fn snapshot(&self) -> BrickResult<Vec<SubvolumeId>> {
        let ids = self.membership.select_all_active();
        if ids.is_empty() {
            return Err(BrickError::NoActiveSubvolumes);
        }
        MirrorStatsInner::bump(&self.stats.fan_outs);
        Ok(ids)
    }

    fn first_active(&self, session: &FileSession) -> BrickResult<SessionEntry> {
        session
            .entries()
            .iter()
            .copied()
            .find(|e| self.membership.is_active(e.subvolume))
            .ok_or(BrickError::NoActiveSubvolumes)
    }

    /// Undo `done` in reverse order, ejecting wherever the undo fails.
    fn roll_back<T, U>(&self, op: &'static str, path: &str, done: &[T], undo: U)
    where
        T: Target,
        U: Fn(&dyn Brick, T) -> BrickResult<()>,
    {
        if done.is_empty() {
            return;
        }
        MirrorStatsInner::bump(&self.stats.rollbacks);
        for &target in done.iter().rev() {
            let subvolume = self.membership.subvolume(target.subvolume());
            if let Err(source) = undo(subvolume.brick(), target) {
                let failure = RollbackFailure {
                    op,
                    path: path.to_string(),
                    subvolume: subvolume.name().to_string(),
                    source,
                };
                error!("{}", failure);
                MirrorStatsInner::bump(&self.stats.rollback_failures);
                self.eject(target.subvolume());
            }
        }
    }

    /// All or nothing: on failure, undo every earlier success and fail.
    fn apply_or_undo<T, F, U>(
        &self,
        op: &'static str,
        path: &str,
        targets: &[T],
        apply: F,
        undo: U,
    ) -> BrickResult<()>
    where
        T: Target,
        F: Fn(&dyn Brick, T) -> BrickResult<()>,
        U: Fn(&dyn Brick, T) -> BrickResult<()>,
    {
        for (i, &target) in targets.iter().enumerate() {
            let subvolume = self.membership.subvolume(target.subvolume());
            if let Err(e) = apply(subvolume.brick(), target) {
                debug!("{} {} failed on {}: {}", op, path, subvolume.name(), e);
                self.roll_back(op, path, &targets[..i], &undo);
                return Err(e);
            }
        }
        Ok(())
    }

    /// First failure aborts; later failures eject and the call carries on.
    fn apply_or_eject<T, F>(
        &self,
        op: &'static str,
        path: &str,
        targets: &[T],
        apply: F,
    ) -> BrickResult<()>
    where
        T: Target,
        F: Fn(&dyn Brick, T) -> BrickResult<()>,
    {
        for (i, &target) in targets.iter().enumerate() {
            let subvolume = self.membership.subvolume(target.subvolume());
            if let Err(e) = apply(subvolume.brick(), target) {
                if i == 0 {
                    return Err(e);
                }
                error!(
                    "{} of {} failed on subvolume {} after succeeding elsewhere: {}",
                    op,
                    path,
                    subvolume.name(),
                    e
                );
                self.eject(target.subvolume());
            }
        }
        Ok(())
    }

    /// Restore the backup on earlier successes still active and fail, or,
    /// without a backup, eject the failing subvolume and carry on.
    fn apply_with_backup<T, F, R>(
        &self,
        op: &'static str,
        path: &str,
        targets: &[T],
        apply: F,
        restore: Option<R>,
    ) -> BrickResult<()>
    where
        T: Target,
        F: Fn(&dyn Brick, T) -> BrickResult<()>,
        R: Fn(&dyn Brick, T) -> BrickResult<()>,
    {
        for (i, &target) in targets.iter().enumerate() {
            let subvolume = self.membership.subvolume(target.subvolume());
            let Err(e) = apply(subvolume.brick(), target) else {
                continue;
            };
            if i == 0 {
                return Err(e);
            }
            match &restore {
                Some(restore) => {
                    debug!("{} {} failed on {}: {}", op, path, subvolume.name(), e);
                    let done: Vec<T> = targets[..i]
                        .iter()
                        .copied()
                        .filter(|t| self.membership.is_active(t.subvolume()))
                        .collect();
                    self.roll_back(op, path, &done, restore);
                    return Err(e);
                }
                None => {
                    error!(
                        "{} of {} failed midway at subvolume {}: {}; no backup, rollback impossible",
                        op,
                        path,
                        subvolume.name(),
                        e
                    );
                    self.eject(target.subvolume());
                }
            }
        }
        Ok(())
    }

    fn note_backup(&self, op: &str, path: &str, available: bool) {
        if !available {
            debug!("no backup for {} of {}, proceeding without rollback", op, path);
            MirrorStatsInner::bump(&self.stats.backups_unavailable);
        }
    }

    /// Open `path` and bind the session to its subvolumes.
    ///
    /// Read-only opens bind the first active subvolume only. Write-capable
    /// opens bind every active subvolume; if one fails, the handles already
    /// opened are released again and its error is returned.
    pub fn open_session(
        &self,
        ctx: &Context,
        path: &str,
        flags: OpenFlags,
    ) -> BrickResult<FileSession> {
        if !flags.is_write_capable() {
            let id = self.reader_id()?;
            let fh = self.membership.subvolume(id).brick().open(ctx, path, flags)?;
            return Ok(FileSession::Read(SessionEntry::new(id, fh)));
        }

        let ids = self.snapshot()?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let subvolume = self.membership.subvolume(id);
            match subvolume.brick().open(ctx, path, flags) {
                Ok(fh) => entries.push(SessionEntry::new(id, fh)),
                Err(e) => {
                    debug!("open {} failed on {}: {}", path, subvolume.name(), e);
                    self.roll_back("open", path, &entries, |b: &dyn Brick, entry: SessionEntry| {
                        b.release(ctx, path, entry.handle)
                    });
                    return Err(e);
                }
            }
        }
        Ok(FileSession::Write(entries))
    }

    /// Read through the first still-active subvolume of the session.
    pub fn read_session(
        &self,
        ctx: &Context,
        path: &str,
        session: &FileSession,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        let entry = self.first_active(session)?;
        self.membership
            .subvolume(entry.subvolume)
            .brick()
            .read(ctx, path, entry.handle, offset, size)
    }

    /// Write `data` at `offset` on every active subvolume of the session.
    ///
    /// The range is locked and its pre-image read from the first active
    /// subvolume. If a later subvolume fails, the pre-image is written back
    /// where the write already succeeded and the error is returned. Without a
    /// pre-image (short read, lock or read failure) the failing subvolume is
    /// ejected instead.
    pub fn write_session(
        &self,
        ctx: &Context,
        path: &str,
        session: &FileSession,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        let targets: Vec<SessionEntry> = session
            .entries()
            .iter()
            .copied()
            .filter(|e| self.membership.is_active(e.subvolume))
            .collect();
        let primary = *targets.first().ok_or(BrickError::NoActiveSubvolumes)?;
        MirrorStatsInner::bump(&self.stats.fan_outs);

        let primary_brick = self.membership.subvolume(primary.subvolume).brick_arc();
        let (lock, pre_image) = if data.is_empty() {
            (None, Some(Vec::new()))
        } else {
            match ensure_lock(
                primary_brick.clone(),
                ctx,
                path,
                primary.handle,
                offset,
                data.len() as u64,
                backup_lock_owner(),
            ) {
                Ok(lock) => {
                    let pre_image =
                        match primary_brick.read(ctx, path, primary.handle, offset, data.len()) {
                            Ok(buf) if buf.len() == data.len() => Some(buf),
                            _ => None,
                        };
                    (lock, pre_image)
                }
                Err(_) => (None, None),
            }
        };
        self.note_backup("write", path, pre_image.is_some());

        let restore = pre_image.map(|old| {
            move |b: &dyn Brick, entry: SessionEntry| write_all(b, ctx, path, entry.handle, offset, &old)
        });
        let result = self.apply_with_backup(
            "write",
            path,
            &targets,
            |b, entry| write_all(b, ctx, path, entry.handle, offset, data),
            restore,
        );
        drop(lock);
        result.map(|()| data.len())
    }

    /// Run a session-scoped call on each active binding; after one success,
    /// failures eject instead of failing the call.
    fn sync_session<F>(
        &self,
        op: &'static str,
        path: &str,
        session: &FileSession,
        apply: F,
    ) -> BrickResult<()>
    where
        F: Fn(&dyn Brick, SessionEntry) -> BrickResult<()>,
    {
        let mut result = Err(BrickError::NoActiveSubvolumes);
        for &entry in session.entries() {
            if !self.membership.is_active(entry.subvolume) {
                continue;
            }
            let subvolume = self.membership.subvolume(entry.subvolume);
            match apply(subvolume.brick(), entry) {
                Ok(()) => result = Ok(()),
                Err(e) if result.is_err() => return Err(e),
                Err(e) => {
                    error!(
                        "{} of {} failed on subvolume {} after succeeding elsewhere: {}",
                        op,
                        path,
                        subvolume.name(),
                        e
                    );
                    self.eject(entry.subvolume);
                }
            }
        }
        result
    }

    /// Flush every active binding of the session.
    pub fn flush_session(&self, ctx: &Context, path: &str, session: &FileSession) -> BrickResult<()> {
        self.sync_session("flush", path, session, |b, entry| {
            b.flush(ctx, path, entry.handle)
        })
    }

    /// Sync every active binding of the session to stable storage.
    pub fn fsync_session(
        &self,
        ctx: &Context,
        path: &str,
        session: &FileSession,
        datasync: bool,
    ) -> BrickResult<()> {
        self.sync_session("fsync", path, session, |b, entry| {
            b.fsync(ctx, path, entry.handle, datasync)
        })
    }

    /// Close the session everywhere, including on subvolumes ejected since
    /// it was opened, whose failures are ignored.
    ///
    /// Fails only if the first failing active subvolume failed before any
    /// binding was released; later active failures eject.
    pub fn release_session(
        &self,
        ctx: &Context,
        path: &str,
        session: FileSession,
    ) -> BrickResult<()> {
        let mut released = false;
        let mut ignored = None;
        for &entry in session.entries() {
            let subvolume = self.membership.subvolume(entry.subvolume);
            match subvolume.brick().release(ctx, path, entry.handle) {
                Ok(()) => released = true,
                Err(e) if !self.membership.is_active(entry.subvolume) => {
                    debug!(
                        "ignoring release failure of {} on ejected subvolume {}: {}",
                        path,
                        subvolume.name(),
                        e
                    );
                    ignored = Some(e);
                }
                Err(e) if !released => return Err(e),
                Err(e) => {
                    error!(
                        "Closing {} on subvolume {} failed: {}, ejecting it",
                        path,
                        subvolume.name(),
                        e
                    );
                    self.eject(entry.subvolume);
                }
            }
        }
        match ignored {
            Some(e) if !released => Err(e),
            _ => Ok(()),
        }
    }

    /// Apply an advisory lock command through the session's first active
    /// subvolume, the one backup locks are taken on.
    pub fn lock_session(
        &self,
        ctx: &Context,
        path: &str,
        session: &FileSession,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        let entry = self.first_active(session)?;
        self.membership
            .subvolume(entry.subvolume)
            .brick()
            .lock(ctx, path, entry.handle, cmd, lock)
    }

    /// Open a directory on the first active subvolume.
    pub fn open_dir_session(&self, ctx: &Context, path: &str) -> BrickResult<DirSession> {
        let id = self.reader_id()?;
        let fh = self.membership.subvolume(id).brick().opendir(ctx, path)?;
        Ok(DirSession {
            entry: SessionEntry::new(id, fh),
        })
    }

    /// List entries of an open directory.
    pub fn read_dir_session(
        &self,
        ctx: &Context,
        path: &str,
        session: &DirSession,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        self.membership
            .subvolume(session.entry.subvolume)
            .brick()
            .readdir(ctx, path, session.entry.handle, offset)
    }

    /// Sync an open directory.
    pub fn fsync_dir_session(
        &self,
        ctx: &Context,
        path: &str,
        session: &DirSession,
        datasync: bool,
    ) -> BrickResult<()> {
        self.membership
            .subvolume(session.entry.subvolume)
            .brick()
            .fsyncdir(ctx, path, session.entry.handle, datasync)
    }

    /// Close an open directory. The session is consumed whatever the outcome.
    pub fn release_dir_session(
        &self,
        ctx: &Context,
        path: &str,
        session: DirSession,
    ) -> BrickResult<()> {
        self.membership
            .subvolume(session.entry.subvolume)
            .brick()
            .releasedir(ctx, path, session.entry.handle)
    }

    /// `setxattr` on every active subvolume. The prior value is backed up
    /// under a whole-file lock, taken through a transient read-only open since
    /// the caller need not have the file open.
    fn set_xattr_locked(
        &self,
        ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        let transient = match self.open_session(ctx, path, OpenFlags::read_only()) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!("cannot open {} to lock it for backup: {}", path, e);
                None
            }
        };
        let lock = transient.as_ref().map(|session| {
            let entry = session.entries()[0];
            ensure_lock(
                self.membership.subvolume(entry.subvolume).brick_arc(),
                ctx,
                path,
                entry.handle,
                0,
                0,
                backup_lock_owner(),
            )
        });
        let (lock, backup) = match lock {
            Some(Ok(lock)) => {
                let backup = match self.getxattr(ctx, path, name) {
                    Ok(old) => Some(XattrBackup::Value(old)),
                    Err(e) if e.is(libc::ENODATA) => Some(XattrBackup::Absent),
                    Err(_) => None,
                };
                (lock, backup)
            }
            _ => (None, None),
        };
        let result = self.snapshot().and_then(|ids| {
            self.note_backup("setxattr", path, backup.is_some());
            let restore = backup.map(|prior| {
                move |b: &dyn Brick, _: SubvolumeId| match &prior {
                    XattrBackup::Value(old) => {
                        b.setxattr(ctx, path, name, old, XattrFlags::Replace)
                    }
                    XattrBackup::Absent => b.removexattr(ctx, path, name),
                }
            });
            self.apply_with_backup(
                "setxattr",
                path,
                &ids,
                |b, _| b.setxattr(ctx, path, name, value, flags),
                restore,
            )
        });

        drop(lock);
        if let Some(session) = transient {
            if let Err(e) = self.release_session(ctx, path, session) {
                error!("Opened {} temporarily but now cannot close it: {}", path, e);
            }
        }
        result
    }
}

impl std::fmt::Debug for MirrorBrick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorBrick")
            .field("name", &self.name)
            .field("membership", &self.membership)
            .finish()
    }
}

impl Brick for MirrorBrick {
    fn getattr(&self, ctx: &Context, path: &str) -> BrickResult<FileAttr> {
        self.reader()?.brick().getattr(ctx, path)
    }

    fn readlink(&self, ctx: &Context, path: &str) -> BrickResult<String> {
        self.reader()?.brick().readlink(ctx, path)
    }

    fn mknod(&self, ctx: &Context, path: &str, mode: u32, rdev: u64) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_undo(
            "mknod",
            path,
            &ids,
            |b, _| b.mknod(ctx, path, mode, rdev),
            |b, _| b.unlink(ctx, path),
        )
    }

    fn mkdir(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_undo(
            "mkdir",
            path,
            &ids,
            |b, _| b.mkdir(ctx, path, mode),
            |b, _| b.rmdir(ctx, path),
        )
    }

    fn unlink(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_eject("unlink", path, &ids, |b, _| b.unlink(ctx, path))
    }

    fn rmdir(&self, ctx: &Context, path: &str) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_eject("rmdir", path, &ids, |b, _| b.rmdir(ctx, path))
    }

    fn symlink(&self, ctx: &Context, target: &str, link: &str) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_undo(
            "symlink",
            link,
            &ids,
            |b, _| b.symlink(ctx, target, link),
            |b, _| b.unlink(ctx, link),
        )
    }

    fn rename(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_undo(
            "rename",
            from,
            &ids,
            |b, _| b.rename(ctx, from, to),
            |b, _| b.rename(ctx, to, from),
        )
    }

    fn link(&self, ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_undo(
            "link",
            to,
            &ids,
            |b, _| b.link(ctx, from, to),
            |b, _| b.unlink(ctx, to),
        )
    }

    fn chmod(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        let backup = self.getattr(ctx, path).ok();
        let ids = self.snapshot()?;
        self.note_backup("chmod", path, backup.is_some());
        let restore = backup
            .map(|old| move |b: &dyn Brick, _: SubvolumeId| b.chmod(ctx, path, old.perm));
        self.apply_with_backup(
            "chmod",
            path,
            &ids,
            |b, _| b.chmod(ctx, path, mode),
            restore,
        )
    }

    fn chown(&self, ctx: &Context, path: &str, uid: u32, gid: u32) -> BrickResult<()> {
        let backup = self.getattr(ctx, path).ok();
        let ids = self.snapshot()?;
        self.note_backup("chown", path, backup.is_some());
        let restore = backup.map(|old| {
            move |b: &dyn Brick, _: SubvolumeId| b.chown(ctx, path, old.uid, old.gid)
        });
        self.apply_with_backup(
            "chown",
            path,
            &ids,
            |b, _| b.chown(ctx, path, uid, gid),
            restore,
        )
    }

    fn truncate(&self, ctx: &Context, path: &str, size: u64) -> BrickResult<()> {
        let ids = self.snapshot()?;
        self.apply_or_eject("truncate", path, &ids, |b, _| b.truncate(ctx, path, size))
    }

    fn open(&self, ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        let session = self.open_session(ctx, path, flags)?;
        Ok(self.files.insert(session))
    }

    fn read(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        let session = self.files.get(fh)?;
        self.read_session(ctx, path, &session, offset, size)
    }

    fn write(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        let session = self.files.get(fh)?;
        self.write_session(ctx, path, &session, offset, data)
    }

    fn statfs(&self, ctx: &Context, path: &str) -> BrickResult<StatFs> {
        self.reader()?.brick().statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        let session = self.files.get(fh)?;
        self.flush_session(ctx, path, &session)
    }

    fn release(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        let session = self.files.remove(fh)?;
        self.release_session(ctx, path, session)
    }

    fn fsync(&self, ctx: &Context, path: &str, fh: FileHandle, datasync: bool) -> BrickResult<()> {
        let session = self.files.get(fh)?;
        self.fsync_session(ctx, path, &session, datasync)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        self.set_xattr_locked(ctx, path, name, value, flags)
    }

    fn getxattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<Vec<u8>> {
        self.reader()?.brick().getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &str) -> BrickResult<Vec<String>> {
        self.reader()?.brick().listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &str, name: &str) -> BrickResult<()> {
        let backup = self.getxattr(ctx, path, name).ok();
        let ids = self.snapshot()?;
        self.note_backup("removexattr", path, backup.is_some());
        let restore = backup.map(|old| {
            move |b: &dyn Brick, _: SubvolumeId| {
                b.setxattr(ctx, path, name, &old, XattrFlags::Create)
            }
        });
        self.apply_with_backup(
            "removexattr",
            path,
            &ids,
            |b, _| b.removexattr(ctx, path, name),
            restore,
        )
    }

    fn opendir(&self, ctx: &Context, path: &str) -> BrickResult<FileHandle> {
        let session = self.open_dir_session(ctx, path)?;
        Ok(self.dirs.insert(session))
    }

    fn readdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        let session = self.dirs.get(fh)?;
        self.read_dir_session(ctx, path, &session, offset)
    }

    fn releasedir(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        let session = self.dirs.remove(fh)?;
        self.release_dir_session(ctx, path, session)
    }

    fn fsyncdir(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        datasync: bool,
    ) -> BrickResult<()> {
        let session = self.dirs.get(fh)?;
        self.fsync_dir_session(ctx, path, &session, datasync)
    }

    fn lock(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        let session = self.files.get(fh)?;
        self.lock_session(ctx, path, &session, cmd, lock)
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BrickResult<()> {
        let backup = self.getattr(ctx, path).ok();
        let ids = self.snapshot()?;
        self.note_backup("utimens", path, backup.is_some());
        let restore = backup.map(|old| {
            move |b: &dyn Brick, _: SubvolumeId| b.utimens(ctx, path, old.atime, old.mtime)
        });
        self.apply_with_backup(
            "utimens",
            path,
            &ids,
            |b, _| b.utimens(ctx, path, atime, mtime),
            restore,
        )
    }
}
