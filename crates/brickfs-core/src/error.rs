//! Error types shared by every brick.

use thiserror::Error;

/// Result type alias for brick operations.
pub type BrickResult<T> = Result<T, BrickError>;

/// Errno reported when a brick has no active subvolumes left to serve a call.
pub const ENOSUBVOLS: i32 = libc::ECHILD;

/// Error variants for brick operations.
///
/// Every error crossing a brick boundary is a single POSIX-style code; there
/// is no partial or multi-status result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrickError {
    /// A selection routine was asked for at least one active subvolume and
    /// none exist.
    #[error("No active subvolumes available")]
    NoActiveSubvolumes,

    /// A positive POSIX errno reported by a backend.
    #[error("Backend error {0}: {}", errno_message(.0))]
    Os(i32),
}

fn errno_message(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}

impl BrickError {
    /// Build an error from a positive errno value.
    pub fn from_errno(errno: i32) -> Self {
        if errno == ENOSUBVOLS {
            BrickError::NoActiveSubvolumes
        } else {
            BrickError::Os(errno)
        }
    }

    /// The positive errno this error maps to.
    pub fn errno(&self) -> i32 {
        match self {
            BrickError::NoActiveSubvolumes => ENOSUBVOLS,
            BrickError::Os(errno) => *errno,
        }
    }

    /// The negated errno, as returned by the upward operation interface.
    pub fn as_negative(&self) -> i32 {
        -self.errno()
    }

    /// Operation is not implemented by this brick.
    pub fn not_implemented() -> Self {
        BrickError::Os(libc::ENOSYS)
    }

    /// Returns true if this is the given errno.
    pub fn is(&self, errno: i32) -> bool {
        self.errno() == errno
    }
}

impl From<std::io::Error> for BrickError {
    fn from(err: std::io::Error) -> Self {
        BrickError::from_errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}
