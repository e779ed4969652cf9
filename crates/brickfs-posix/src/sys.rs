//! Thin wrappers over the system calls `std` does not expose.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use brickfs_core::{BrickError, BrickResult, StatFs, Timespec};

fn path_cstr(path: &Path) -> BrickResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| BrickError::Os(libc::EINVAL))
}

fn name_cstr(name: &str) -> BrickResult<CString> {
    CString::new(name).map_err(|_| BrickError::Os(libc::EINVAL))
}

fn last_error() -> BrickError {
    std::io::Error::last_os_error().into()
}

fn check(ret: libc::c_int) -> BrickResult<()> {
    if ret == -1 {
        Err(last_error())
    } else {
        Ok(())
    }
}

fn to_timespec(t: Timespec) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = t.secs as libc::time_t;
    ts.tv_nsec = t.nsecs as libc::c_long;
    ts
}

pub(crate) fn mknod(path: &Path, mode: u32, rdev: u64) -> BrickResult<()> {
    let c = path_cstr(path)?;
    check(unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
}

pub(crate) fn truncate(path: &Path, size: u64) -> BrickResult<()> {
    let c = path_cstr(path)?;
    let size = libc::off_t::try_from(size).map_err(|_| BrickError::Os(libc::EFBIG))?;
    check(unsafe { libc::truncate(c.as_ptr(), size) })
}

/// Set both times of `path` without following a final symlink.
pub(crate) fn utimens(path: &Path, atime: Timespec, mtime: Timespec) -> BrickResult<()> {
    let c = path_cstr(path)?;
    let times = [to_timespec(atime), to_timespec(mtime)];
    check(unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub(crate) fn statvfs(path: &Path) -> BrickResult<StatFs> {
    let c = path_cstr(path)?;
    let mut buf = MaybeUninit::<libc::statvfs>::uninit();
    check(unsafe { libc::statvfs(c.as_ptr(), buf.as_mut_ptr()) })?;
    let st = unsafe { buf.assume_init() };
    Ok(StatFs {
        bsize: st.f_bsize as u64,
        frsize: st.f_frsize as u64,
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
        files: st.f_files as u64,
        ffree: st.f_ffree as u64,
        namemax: st.f_namemax as u64,
    })
}

pub(crate) fn lsetxattr(path: &Path, name: &str, value: &[u8], flags: i32) -> BrickResult<()> {
    let (c, n) = (path_cstr(path)?, name_cstr(name)?);
    check(unsafe {
        libc::lsetxattr(
            c.as_ptr(),
            n.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    })
}

/// Read an attribute value, growing the buffer while it keeps changing size.
pub(crate) fn lgetxattr(path: &Path, name: &str) -> BrickResult<Vec<u8>> {
    let (c, n) = (path_cstr(path)?, name_cstr(name)?);
    loop {
        let size = unsafe { libc::lgetxattr(c.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(last_error());
        }
        let mut buf = vec![0u8; size as usize];
        let got = unsafe {
            libc::lgetxattr(
                c.as_ptr(),
                n.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if got >= 0 {
            buf.truncate(got as usize);
            return Ok(buf);
        }
        let err = last_error();
        if !err.is(libc::ERANGE) {
            return Err(err);
        }
    }
}

pub(crate) fn llistxattr(path: &Path) -> BrickResult<Vec<String>> {
    let c = path_cstr(path)?;
    let raw = loop {
        let size = unsafe { libc::llistxattr(c.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(last_error());
        }
        let mut buf = vec![0u8; size as usize];
        let got = unsafe {
            libc::llistxattr(c.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if got >= 0 {
            buf.truncate(got as usize);
            break buf;
        }
        let err = last_error();
        if !err.is(libc::ERANGE) {
            return Err(err);
        }
    };
    Ok(raw
        .split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect())
}

pub(crate) fn lremovexattr(path: &Path, name: &str) -> BrickResult<()> {
    let (c, n) = (path_cstr(path)?, name_cstr(name)?);
    check(unsafe { libc::lremovexattr(c.as_ptr(), n.as_ptr()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interior_nul_is_einval() {
        let err = path_cstr(Path::new("a\0b")).unwrap_err();
        assert!(err.is(libc::EINVAL));
        assert!(name_cstr("user.\0x").unwrap_err().is(libc::EINVAL));
    }

    #[test]
    fn test_to_timespec() {
        let ts = to_timespec(Timespec::new(12, 34));
        assert_eq!(ts.tv_sec, 12);
        assert_eq!(ts.tv_nsec, 34);
    }

    #[test]
    fn test_truncate_missing_file() {
        let err = truncate(Path::new("/nonexistent/brickfs/file"), 0).unwrap_err();
        assert!(err.is(libc::ENOENT));
    }
}
