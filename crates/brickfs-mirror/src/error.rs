//! Error types for the mirror brick.

use brickfs_core::BrickError;
use thiserror::Error;

/// Errors raised while constructing a mirror.
///
/// Operation errors are plain [`BrickError`]s; this type only covers setup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MirrorError {
    /// A mirror was configured with no subvolumes.
    #[error("a mirror needs at least one subvolume")]
    NoSubvolumes,
}

/// A compensating operation failed while undoing a partial fan-out.
///
/// Never returned to callers: every rollback failure ends in the ejection of
/// the subvolume it happened on. It exists so the diagnostic is built in one
/// place.
#[derive(Debug, Error)]
#[error("could not roll back {op} of {path} on subvolume {subvolume}: {source}")]
pub(crate) struct RollbackFailure {
    pub(crate) op: &'static str,
    pub(crate) path: String,
    pub(crate) subvolume: String,
    #[source]
    pub(crate) source: BrickError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failure_message_names_everything() {
        let failure = RollbackFailure {
            op: "mkdir",
            path: "/d".to_string(),
            subvolume: "disk-b".to_string(),
            source: BrickError::Os(libc::EIO),
        };
        let msg = failure.to_string();
        assert!(msg.contains("mkdir"));
        assert!(msg.contains("/d"));
        assert!(msg.contains("disk-b"));
    }

    #[test]
    fn test_no_subvolumes_display() {
        assert!(MirrorError::NoSubvolumes.to_string().contains("at least one"));
    }
}
