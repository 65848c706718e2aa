//! Plain value types shared between the journal engine and its embedders.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A block number on the filesystem device, in units of the filesystem
/// block size.
///
/// The journal never interprets these beyond copying them into BLOCKS and
/// REVOCATIONS records; splitting a multi-block buffer into per-block units
/// happens at replay time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNo(pub u64);

impl BlockNo {
    /// The block `offset` filesystem blocks past this one.
    pub fn offset(self, offset: u64) -> Self {
        BlockNo(self.0 + offset)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a buffer inside the embedder's buffer cache.
///
/// The journal only ever holds ids, never the buffers themselves; all
/// access to buffer contents and metadata goes through [`BufferCache`].
///
/// [`BufferCache`]: crate::device::BufferCache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// A pending block deallocation: `len` bytes starting at `block`.
///
/// Queued by the filesystem when it frees blocks that may have been logged
/// earlier in the same or a previous transaction; written to the log as a
/// REVOCATIONS record so replay will not resurrect stale contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deallocation {
    /// First filesystem block of the freed range.
    pub block: BlockNo,
    /// Length of the freed range in bytes (a filesystem-block multiple).
    pub len: u32,
}

/// An allocated-but-unlinked inode, tracked so replay can finish removing
/// it even if the unlink never reached the on-disk metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInode {
    /// Inode number.
    pub inode: u64,
    /// File mode bits, needed to release the inode correctly.
    pub mode: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_no_offset() {
        assert_eq!(BlockNo(10).offset(3), BlockNo(13));
        assert_eq!(BlockNo(0).offset(0), BlockNo(0));
    }

    #[test]
    fn test_display() {
        assert_eq!(BlockNo(42).to_string(), "42");
        assert_eq!(BufferId(7).to_string(), "buf#7");
    }
}
