#![warn(missing_docs)]

//! BrickFS cache brick: metadata of an origin subvolume kept in a cache subvolume
//!
//! Attribute lookups and symlink targets are answered from the cache once
//! seen; everything else goes to the origin. The cache is never authoritative:
//! any failure on it is logged and the origin's answer stands.

pub mod cache;
pub mod record;

pub use cache::{CacheBrick, CacheStats};
pub use record::{AttrRecord, RecordError, STAT_XATTR};
