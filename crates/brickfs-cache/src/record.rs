//! The attribute record stored on cache placeholders.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use brickfs_core::FileAttr;

/// Extended attribute holding the encoded record on a cache node.
pub const STAT_XATTR: &str = "user.brickfs.cache.stat";

const RECORD_VERSION: u8 = 1;

/// Errors decoding a stored record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The bytes are not a record.
    #[error("malformed attribute record: {0}")]
    Malformed(#[from] bincode::Error),

    /// Written by an incompatible version.
    #[error("attribute record version {0} is not supported")]
    Version(u8),
}

/// Cached attributes of one origin path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrRecord {
    version: u8,
    /// Attributes as last reported by the origin.
    pub attr: FileAttr,
}

impl AttrRecord {
    /// Wrap attributes reported by the origin.
    pub fn new(attr: FileAttr) -> Self {
        Self {
            version: RECORD_VERSION,
            attr,
        }
    }

    /// Encode for storage.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a stored record.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let record: AttrRecord = bincode::deserialize(bytes)?;
        if record.version != RECORD_VERSION {
            return Err(RecordError::Version(record.version));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brickfs_core::{FileKind, Timespec};

    fn attr() -> FileAttr {
        FileAttr {
            ino: 42,
            kind: FileKind::RegularFile,
            perm: 0o640,
            nlink: 1,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 12345,
            blocks: 32,
            blksize: 4096,
            atime: Timespec::new(1, 2),
            mtime: Timespec::new(3, 4),
            ctime: Timespec::new(5, 6),
        }
    }

    #[test]
    fn test_decode_restores_attributes() {
        let bytes = AttrRecord::new(attr()).encode().unwrap();
        assert_eq!(AttrRecord::decode(&bytes).unwrap().attr, attr());
    }

    #[test]
    fn test_truncated_record_is_malformed() {
        let bytes = AttrRecord::new(attr()).encode().unwrap();
        let err = AttrRecord::decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, RecordError::Malformed(_)));
    }

    #[test]
    fn test_foreign_version_rejected() {
        let mut bytes = AttrRecord::new(attr()).encode().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            AttrRecord::decode(&bytes).unwrap_err(),
            RecordError::Version(9)
        ));
    }
}
