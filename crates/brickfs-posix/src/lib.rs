#![warn(missing_docs)]

//! BrickFS POSIX brick: the leaf that stores data in a local directory
//!
//! Every brick path is resolved under a configured root directory and the
//! operation is carried out with the matching system call. Open files and
//! directory listings are kept in handle tables; advisory locks are kept per
//! file in the brick so that lock owners, not processes, decide conflicts.

pub mod error;
pub mod posix;
mod sys;

pub use error::PosixError;
pub use posix::PosixBrick;
