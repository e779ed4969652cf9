#![warn(missing_docs)]

//! BrickFS core: the brick capability interface shared by every storage brick
//!
//! Bricks implement one uniform filesystem-operation interface and stack by
//! calling into each other as subvolumes. This crate carries that interface,
//! its value types and error taxonomy, and the simple bricks every stack
//! needs: pass-through, in-memory, and a fault-injecting wrapper for tests.

pub mod brick;
pub mod error;
pub mod fault;
pub mod locks;
pub mod memory;
pub mod pass;
pub mod types;

pub use brick::{Brick, Subvolume};
pub use error::{BrickError, BrickResult, ENOSUBVOLS};
pub use fault::{FaultRule, FaultyBrick, Op};
pub use locks::LockList;
pub use memory::MemoryBrick;
pub use pass::PassBrick;
pub use types::{
    AccessMode, Context, DirEntry, FileAttr, FileHandle, FileKind, FileLock, LockCmd, LockKind,
    OpenFlags, StatFs, Timespec, XattrFlags,
};
