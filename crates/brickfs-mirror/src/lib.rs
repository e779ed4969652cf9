#![warn(missing_docs)]

//! BrickFS mirror: replicates each filesystem operation over N subvolumes
//!
//! A mirror fans each operation out to its active subvolumes, undoes partial
//! failures where an undo exists, and permanently ejects a subvolume once it
//! can no longer be trusted. It implements the same `Brick` interface it
//! consumes, so mirrors stack under other bricks, mirrors included.

pub(crate) mod backup;
pub mod error;
pub mod membership;
pub mod mirror;
pub mod session;
pub mod stats;

pub use error::MirrorError;
pub use membership::{Membership, MembershipEvent, SubvolumeId};
pub use mirror::MirrorBrick;
pub use session::{DirSession, FileSession, HandleTable, SessionEntry};
pub use stats::MirrorStats;
