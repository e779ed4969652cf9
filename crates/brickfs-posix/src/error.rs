//! Errors raised while setting up a POSIX brick.

use std::path::PathBuf;

use thiserror::Error;

/// Construction errors. Operation errors are plain `BrickError`s.
#[derive(Debug, Error)]
pub enum PosixError {
    /// The root path does not name a directory.
    #[error("brick root {0} is not a directory")]
    NotADirectory(PathBuf),

    /// The root path could not be inspected.
    #[error("cannot access brick root {path}: {source}")]
    Root {
        /// The configured root.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
