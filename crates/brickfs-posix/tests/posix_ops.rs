//! POSIX brick operations against a temporary directory.

use std::fs;
use std::os::unix::fs::MetadataExt;

use brickfs_core::{
    Brick, Context, FileKind, FileLock, LockCmd, OpenFlags, Timespec, XattrFlags,
};
use brickfs_posix::PosixBrick;
use tempfile::TempDir;

fn setup() -> (TempDir, PosixBrick) {
    let dir = tempfile::tempdir().unwrap();
    let brick = PosixBrick::new("posix", dir.path()).unwrap();
    (dir, brick)
}

fn ctx() -> Context {
    Context::current()
}

fn regular(perm: u32) -> u32 {
    libc::S_IFREG as u32 | perm
}

#[test]
fn test_mknod_mkdir_and_getattr() {
    let (dir, brick) = setup();
    brick.mkdir(&ctx(), "/d", 0o700).unwrap();
    brick.mknod(&ctx(), "/d/f", regular(0o600), 0).unwrap();

    let attr = brick.getattr(&ctx(), "/d/f").unwrap();
    assert_eq!(attr.kind, FileKind::RegularFile);
    assert_eq!(attr.size, 0);
    assert_eq!(attr.ino, fs::metadata(dir.path().join("d/f")).unwrap().ino());
    assert!(brick.getattr(&ctx(), "/d").unwrap().is_dir());

    assert!(brick.mkdir(&ctx(), "/d", 0o700).unwrap_err().is(libc::EEXIST));
    assert!(brick.getattr(&ctx(), "/nope").unwrap_err().is(libc::ENOENT));
}

#[test]
fn test_fifo_via_mknod() {
    let (_dir, brick) = setup();
    brick
        .mknod(&ctx(), "/p", libc::S_IFIFO as u32 | 0o644, 0)
        .unwrap();
    assert_eq!(brick.getattr(&ctx(), "/p").unwrap().kind, FileKind::NamedPipe);
}

#[test]
fn test_read_write_through_handles() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("f"), b"hello world").unwrap();

    let fh = brick.open(&ctx(), "/f", OpenFlags::read_write()).unwrap();
    assert_eq!(brick.write(&ctx(), "/f", fh, 6, b"brick").unwrap(), 5);
    assert_eq!(brick.read(&ctx(), "/f", fh, 0, 64).unwrap(), b"hello brick");
    assert_eq!(brick.read(&ctx(), "/f", fh, 100, 4).unwrap(), b"");
    brick.flush(&ctx(), "/f", fh).unwrap();
    brick.fsync(&ctx(), "/f", fh, true).unwrap();
    brick.release(&ctx(), "/f", fh).unwrap();

    assert_eq!(brick.open_files(), 0);
    assert!(brick.read(&ctx(), "/f", fh, 0, 1).unwrap_err().is(libc::EBADF));
    assert!(brick.release(&ctx(), "/f", fh).unwrap_err().is(libc::EBADF));
}

#[test]
fn test_open_honours_access_mode_and_trunc() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("f"), b"abc").unwrap();

    let ro = brick.open(&ctx(), "/f", OpenFlags::read_only()).unwrap();
    assert!(brick.write(&ctx(), "/f", ro, 0, b"x").is_err());
    brick.release(&ctx(), "/f", ro).unwrap();

    let flags = OpenFlags::write_only().with_extra(libc::O_TRUNC);
    let wo = brick.open(&ctx(), "/f", flags).unwrap();
    assert!(brick.read(&ctx(), "/f", wo, 0, 1).is_err());
    brick.release(&ctx(), "/f", wo).unwrap();
    assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"");
}

#[test]
fn test_unlink_rmdir_rename_link() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("a"), b"1").unwrap();
    brick.mkdir(&ctx(), "/d", 0o755).unwrap();

    brick.link(&ctx(), "/a", "/d/b").unwrap();
    assert_eq!(brick.getattr(&ctx(), "/a").unwrap().nlink, 2);
    brick.rename(&ctx(), "/a", "/c").unwrap();
    assert!(!dir.path().join("a").exists());
    brick.unlink(&ctx(), "/c").unwrap();
    assert_eq!(brick.getattr(&ctx(), "/d/b").unwrap().nlink, 1);

    assert!(brick.rmdir(&ctx(), "/d").unwrap_err().is(libc::ENOTEMPTY));
    brick.unlink(&ctx(), "/d/b").unwrap();
    brick.rmdir(&ctx(), "/d").unwrap();
    assert!(brick.unlink(&ctx(), "/d").unwrap_err().is(libc::ENOENT));
}

#[test]
fn test_symlink_is_not_followed() {
    let (_dir, brick) = setup();
    brick.symlink(&ctx(), "../outside", "/l").unwrap();
    assert_eq!(brick.readlink(&ctx(), "/l").unwrap(), "../outside");
    assert_eq!(brick.getattr(&ctx(), "/l").unwrap().kind, FileKind::Symlink);
    brick.unlink(&ctx(), "/l").unwrap();
}

#[test]
fn test_parent_components_are_refused() {
    let (_dir, brick) = setup();
    assert!(brick.getattr(&ctx(), "/../etc").unwrap_err().is(libc::EACCES));
    assert!(brick.mkdir(&ctx(), "/x/../y", 0o755).unwrap_err().is(libc::EACCES));
}

#[test]
fn test_chmod_chown_truncate_utimens() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("f"), b"0123456789").unwrap();

    brick.chmod(&ctx(), "/f", 0o640).unwrap();
    assert_eq!(brick.getattr(&ctx(), "/f").unwrap().perm, 0o640);

    let before = brick.getattr(&ctx(), "/f").unwrap();
    brick.chown(&ctx(), "/f", u32::MAX, u32::MAX).unwrap();
    let after = brick.getattr(&ctx(), "/f").unwrap();
    assert_eq!((after.uid, after.gid), (before.uid, before.gid));

    brick.truncate(&ctx(), "/f", 4).unwrap();
    assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"0123");

    let (atime, mtime) = (Timespec::new(1_000_000, 0), Timespec::new(2_000_000, 500));
    brick.utimens(&ctx(), "/f", atime, mtime).unwrap();
    let attr = brick.getattr(&ctx(), "/f").unwrap();
    assert_eq!(attr.atime, atime);
    assert_eq!(attr.mtime, mtime);
}

#[test]
fn test_directory_listing() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("b"), b"").unwrap();
    fs::create_dir(dir.path().join("a")).unwrap();

    let fh = brick.opendir(&ctx(), "/").unwrap();
    let entries = brick.readdir(&ctx(), "/", fh, 0).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "a", "b"]);
    assert_eq!(entries[2].kind, FileKind::Directory);
    assert_eq!(entries[3].kind, FileKind::RegularFile);

    let rest = brick.readdir(&ctx(), "/", fh, entries[2].next_offset).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "b");

    brick.fsyncdir(&ctx(), "/", fh, false).unwrap();
    brick.releasedir(&ctx(), "/", fh).unwrap();
    assert_eq!(brick.open_dirs(), 0);
    assert!(brick.opendir(&ctx(), "/b").unwrap_err().is(libc::ENOTDIR));
}

#[test]
fn test_locks_conflict_by_owner() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("f"), b"data").unwrap();
    let a = brick.open(&ctx(), "/f", OpenFlags::read_write()).unwrap();
    let b = brick.open(&ctx(), "/f", OpenFlags::read_only()).unwrap();

    brick
        .lock(&ctx(), "/f", a, LockCmd::Set, &FileLock::write(0, 4, 1))
        .unwrap();
    assert!(brick
        .lock(&ctx(), "/f", b, LockCmd::Set, &FileLock::write(0, 0, 2))
        .unwrap_err()
        .is(libc::EAGAIN));
    let held = brick
        .lock(&ctx(), "/f", b, LockCmd::Get, &FileLock::read(2, 1, 2))
        .unwrap();
    assert_eq!(held.map(|l| l.owner), Some(1));

    // Same owner through another handle never conflicts.
    brick
        .lock(&ctx(), "/f", b, LockCmd::Set, &FileLock::write(0, 4, 1))
        .unwrap();

    brick.release(&ctx(), "/f", a).unwrap();
    brick.release(&ctx(), "/f", b).unwrap();
    let c = brick.open(&ctx(), "/f", OpenFlags::read_only()).unwrap();
    assert!(brick
        .lock(&ctx(), "/f", c, LockCmd::Get, &FileLock::write(0, 0, 3))
        .unwrap()
        .is_none());
}

#[test]
fn test_xattrs_when_supported() {
    let (dir, brick) = setup();
    fs::write(dir.path().join("f"), b"").unwrap();
    match brick.setxattr(&ctx(), "/f", "user.brickfs", b"v1", XattrFlags::Create) {
        Ok(()) => {}
        Err(e) if e.is(libc::ENOTSUP) || e.is(libc::EOPNOTSUPP) || e.is(libc::EPERM) => return,
        Err(e) => panic!("setxattr failed: {}", e),
    }
    assert!(brick
        .setxattr(&ctx(), "/f", "user.brickfs", b"v2", XattrFlags::Create)
        .unwrap_err()
        .is(libc::EEXIST));
    brick
        .setxattr(&ctx(), "/f", "user.brickfs", b"v2", XattrFlags::Replace)
        .unwrap();
    assert_eq!(brick.getxattr(&ctx(), "/f", "user.brickfs").unwrap(), b"v2");
    assert!(brick
        .listxattr(&ctx(), "/f")
        .unwrap()
        .contains(&"user.brickfs".to_string()));
    brick.removexattr(&ctx(), "/f", "user.brickfs").unwrap();
    assert!(brick
        .getxattr(&ctx(), "/f", "user.brickfs")
        .unwrap_err()
        .is(libc::ENODATA));
}

#[test]
fn test_statfs_reports_filesystem() {
    let (_dir, brick) = setup();
    let st = brick.statfs(&ctx(), "/").unwrap();
    assert!(st.bsize > 0);
    assert!(st.namemax > 0);
}
