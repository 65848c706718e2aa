//! On-disk log record formats.
//!
//! Every record occupies a whole number of log-device blocks and starts
//! with the same 8-byte prefix: a 4-byte magic and a 4-byte total length
//! (header block plus any payload and padding). All integers are
//! little-endian.
//!
//! # Commit header (one block, two ping-pong slots before the ring)
//!
//! ```text
//! ┌───────┬───────┬─────────┬──────────┬────────────┬──────┬──────┐
//! │ Magic │ Len   │ Version │ Checksum │ Generation │ Head │ Tail │
//! │ (4)   │ (4)   │ (4)     │ (4)      │ (8)        │ (8)  │ (8)  │
//! ├───────┴───┬───┴─────────┬─────────┬┴─────────┬──┴──────┬─────┴────┐
//! │ Circ off  │ Circ size   │ Log/fs  │ Log id   │ Time    │ Zero pad │
//! │ (8)       │ (8)         │ shifts  │ (16)     │ sec+ns  │ to block │
//! │           │             │ (4+4)   │          │ (8+4)   │          │
//! └───────────┴─────────────┴─────────┴──────────┴─────────┴──────────┘
//! ```
//!
//! # Block list (BLOCKS / REVOCATIONS)
//!
//! Magic, len, count (4), then `count` pairs of (block: 8, len: 4).
//! For BLOCKS the referenced payload bytes follow the header block in the
//! log stream, zero-padded to the next block boundary, and `len` covers
//! header + payload + padding. For REVOCATIONS `len` is one block.
//!
//! # Inode list (INODES)
//!
//! Magic, len (one block), count (4), clear flag (4), then `count` pairs
//! of (inode: 8, mode: 4).

use crate::error::ReplayError;

/// Commit header magic: "RLCH".
pub const COMMIT_MAGIC: u32 = 0x524c_4348;
/// Block list magic: "RLBL".
pub const BLOCKS_MAGIC: u32 = 0x524c_424c;
/// Revocation list magic: "RLRV".
pub const REVOKE_MAGIC: u32 = 0x524c_5256;
/// Inode list magic: "RLIN".
pub const INODES_MAGIC: u32 = 0x524c_494e;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed bytes of a commit header before zero padding.
pub const COMMIT_HEADER_LEN: usize = 92;
/// Prefix bytes of a block/revocation list before the pair array.
pub const BLOCK_LIST_PREFIX: usize = 12;
/// Prefix bytes of an inode list before the pair array.
pub const INODE_LIST_PREFIX: usize = 16;
/// Size of one (u64, u32) pair in either list.
pub const PAIR_LEN: usize = 12;

/// Number of (block, len) pairs one list header block can describe.
pub fn blocks_per_list(block_len: usize) -> usize {
    (block_len - BLOCK_LIST_PREFIX) / PAIR_LEN
}

/// Number of (inode, mode) pairs one inode list block can describe.
pub fn inodes_per_list(block_len: usize) -> usize {
    (block_len - INODE_LIST_PREFIX) / PAIR_LEN
}

/// The 8-byte prefix shared by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPrefix {
    /// Record magic.
    pub magic: u32,
    /// Total record length in bytes, a block multiple.
    pub len: u32,
}

impl RecordPrefix {
    /// Decode the prefix of a record block.
    pub fn decode(buf: &[u8]) -> Self {
        RecordPrefix {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap_or([0; 4])),
            len: u32::from_le_bytes(buf[4..8].try_into().unwrap_or([0; 4])),
        }
    }
}

/// The commit header record.
///
/// Written twice (slot `generation % 2`) so that a crash mid-write always
/// leaves one intact copy; the reader takes the slot with the larger
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitHeader {
    /// Monotonic commit counter; selects the slot and the winner on read.
    pub generation: u64,
    /// Ring head at commit time.
    pub head: u64,
    /// Ring tail at commit time.
    pub tail: u64,
    /// Ring region start, bytes from the log start.
    pub circ_off: u64,
    /// Ring region size in bytes.
    pub circ_size: u64,
    /// log2 of the log device block size.
    pub log_dev_bshift: u32,
    /// log2 of the filesystem block size.
    pub fs_dev_bshift: u32,
    /// Identity of this log instance.
    pub log_id: [u8; 16],
    /// Commit wall-clock time, seconds.
    pub time_sec: u64,
    /// Commit wall-clock time, nanosecond remainder.
    pub time_nsec: u32,
}

impl CommitHeader {
    /// Serialize into one log-device block of `block_len` bytes.
    pub fn encode(&self, block_len: usize) -> Vec<u8> {
        debug_assert!(block_len >= COMMIT_HEADER_LEN);
        let mut buf = vec![0u8; block_len];
        buf[0..4].copy_from_slice(&COMMIT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&(block_len as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        // checksum at 12..16 is filled last
        buf[16..24].copy_from_slice(&self.generation.to_le_bytes());
        buf[24..32].copy_from_slice(&self.head.to_le_bytes());
        buf[32..40].copy_from_slice(&self.tail.to_le_bytes());
        buf[40..48].copy_from_slice(&self.circ_off.to_le_bytes());
        buf[48..56].copy_from_slice(&self.circ_size.to_le_bytes());
        buf[56..60].copy_from_slice(&self.log_dev_bshift.to_le_bytes());
        buf[60..64].copy_from_slice(&self.fs_dev_bshift.to_le_bytes());
        buf[64..80].copy_from_slice(&self.log_id);
        buf[80..88].copy_from_slice(&self.time_sec.to_le_bytes());
        buf[88..92].copy_from_slice(&self.time_nsec.to_le_bytes());

        let checksum = crc32fast::hash(&buf);
        buf[12..16].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserialize from one header slot.
    ///
    /// # Errors
    ///
    /// Rejects bad magic and checksum mismatches; these are fatal to the
    /// replay pass.
    pub fn decode(buf: &[u8]) -> Result<Self, ReplayError> {
        let prefix = RecordPrefix::decode(buf);
        if prefix.magic != COMMIT_MAGIC {
            return Err(ReplayError::BadMagic(prefix.magic));
        }
        if buf.len() < COMMIT_HEADER_LEN {
            return Err(ReplayError::BadGeometry("commit header block too short"));
        }

        let stored = u32::from_le_bytes(buf[12..16].try_into().unwrap_or([0; 4]));
        let mut unsummed = buf.to_vec();
        unsummed[12..16].fill(0);
        let computed = crc32fast::hash(&unsummed);
        if stored != computed {
            return Err(ReplayError::ChecksumMismatch { stored, computed });
        }

        let mut log_id = [0u8; 16];
        log_id.copy_from_slice(&buf[64..80]);
        Ok(CommitHeader {
            generation: u64::from_le_bytes(buf[16..24].try_into().unwrap_or([0; 8])),
            head: u64::from_le_bytes(buf[24..32].try_into().unwrap_or([0; 8])),
            tail: u64::from_le_bytes(buf[32..40].try_into().unwrap_or([0; 8])),
            circ_off: u64::from_le_bytes(buf[40..48].try_into().unwrap_or([0; 8])),
            circ_size: u64::from_le_bytes(buf[48..56].try_into().unwrap_or([0; 8])),
            log_dev_bshift: u32::from_le_bytes(buf[56..60].try_into().unwrap_or([0; 4])),
            fs_dev_bshift: u32::from_le_bytes(buf[60..64].try_into().unwrap_or([0; 4])),
            log_id,
            time_sec: u64::from_le_bytes(buf[80..88].try_into().unwrap_or([0; 8])),
            time_nsec: u32::from_le_bytes(buf[88..92].try_into().unwrap_or([0; 4])),
        })
    }
}

/// Encode a BLOCKS or REVOCATIONS header block.
///
/// `total_len` is the full record length (header + payload + padding for
/// BLOCKS, `block_len` for REVOCATIONS).
pub fn encode_block_list(
    magic: u32,
    total_len: u32,
    pairs: &[(u64, u32)],
    block_len: usize,
) -> Vec<u8> {
    debug_assert!(magic == BLOCKS_MAGIC || magic == REVOKE_MAGIC);
    debug_assert!(pairs.len() <= blocks_per_list(block_len));
    let mut buf = vec![0u8; block_len];
    buf[0..4].copy_from_slice(&magic.to_le_bytes());
    buf[4..8].copy_from_slice(&total_len.to_le_bytes());
    buf[8..12].copy_from_slice(&(pairs.len() as u32).to_le_bytes());
    let mut at = BLOCK_LIST_PREFIX;
    for &(block, len) in pairs {
        buf[at..at + 8].copy_from_slice(&block.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&len.to_le_bytes());
        at += PAIR_LEN;
    }
    buf
}

/// Decode the pair array of a BLOCKS or REVOCATIONS header block.
///
/// # Errors
///
/// Rejects a pair count that does not fit the block.
pub fn decode_block_list(buf: &[u8]) -> Result<Vec<(u64, u32)>, ReplayError> {
    let count = u32::from_le_bytes(buf[8..12].try_into().unwrap_or([0; 4])) as usize;
    if count > blocks_per_list(buf.len()) {
        return Err(ReplayError::CorruptRecords);
    }
    let mut pairs = Vec::with_capacity(count);
    let mut at = BLOCK_LIST_PREFIX;
    for _ in 0..count {
        let block = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8]));
        let len = u32::from_le_bytes(buf[at + 8..at + 12].try_into().unwrap_or([0; 4]));
        pairs.push((block, len));
        at += PAIR_LEN;
    }
    Ok(pairs)
}

/// Encode an INODES record block.
pub fn encode_inode_list(
    pairs: &[(u64, u32)],
    clear: bool,
    block_len: usize,
) -> Vec<u8> {
    debug_assert!(pairs.len() <= inodes_per_list(block_len));
    let mut buf = vec![0u8; block_len];
    buf[0..4].copy_from_slice(&INODES_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&(block_len as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&(pairs.len() as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&u32::from(clear).to_le_bytes());
    let mut at = INODE_LIST_PREFIX;
    for &(inode, mode) in pairs {
        buf[at..at + 8].copy_from_slice(&inode.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&mode.to_le_bytes());
        at += PAIR_LEN;
    }
    buf
}

/// Decoded INODES record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeList {
    /// True if this record subsumes all earlier inode records.
    pub clear: bool,
    /// The (inode, mode) pairs in this record.
    pub inodes: Vec<(u64, u32)>,
}

/// Decode an INODES record block.
///
/// # Errors
///
/// Rejects a pair count that does not fit the block.
pub fn decode_inode_list(buf: &[u8]) -> Result<InodeList, ReplayError> {
    let count = u32::from_le_bytes(buf[8..12].try_into().unwrap_or([0; 4])) as usize;
    if count > inodes_per_list(buf.len()) {
        return Err(ReplayError::CorruptRecords);
    }
    let clear = u32::from_le_bytes(buf[12..16].try_into().unwrap_or([0; 4])) != 0;
    let mut inodes = Vec::with_capacity(count);
    let mut at = INODE_LIST_PREFIX;
    for _ in 0..count {
        let inode = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8]));
        let mode = u32::from_le_bytes(buf[at + 8..at + 12].try_into().unwrap_or([0; 4]));
        inodes.push((inode, mode));
        at += PAIR_LEN;
    }
    Ok(InodeList { clear, inodes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CommitHeader {
        CommitHeader {
            generation: 7,
            head: 5120,
            tail: 1024,
            circ_off: 1024,
            circ_size: 65536,
            log_dev_bshift: 9,
            fs_dev_bshift: 9,
            log_id: [0xAB; 16],
            time_sec: 1_700_000_000,
            time_nsec: 123_456_789,
        }
    }

    #[test]
    fn test_commit_header_round_trip() {
        let wc = header();
        let buf = wc.encode(512);
        assert_eq!(buf.len(), 512);
        assert_eq!(CommitHeader::decode(&buf).unwrap(), wc);
    }

    #[test]
    fn test_commit_header_rejects_bad_magic() {
        let mut buf = header().encode(512);
        buf[0] = b'X';
        assert!(matches!(
            CommitHeader::decode(&buf),
            Err(ReplayError::BadMagic(_))
        ));
    }

    #[test]
    fn test_commit_header_rejects_corruption() {
        let mut buf = header().encode(512);
        buf[30] ^= 0xFF; // flip a bit inside the head field
        assert!(matches!(
            CommitHeader::decode(&buf),
            Err(ReplayError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_block_list_round_trip() {
        let pairs = vec![(100u64, 512u32), (207, 1024), (9, 512)];
        let buf = encode_block_list(BLOCKS_MAGIC, 512 + 2048, &pairs, 512);
        let prefix = RecordPrefix::decode(&buf);
        assert_eq!(prefix.magic, BLOCKS_MAGIC);
        assert_eq!(prefix.len, 2560);
        assert_eq!(decode_block_list(&buf).unwrap(), pairs);
    }

    #[test]
    fn test_block_list_rejects_oversized_count() {
        let mut buf = encode_block_list(REVOKE_MAGIC, 512, &[(1, 512)], 512);
        buf[8..12].copy_from_slice(&10_000u32.to_le_bytes());
        assert!(matches!(
            decode_block_list(&buf),
            Err(ReplayError::CorruptRecords)
        ));
    }

    #[test]
    fn test_inode_list_round_trip() {
        let pairs = vec![(42u64, 0o100644u32), (43, 0o040755)];
        let buf = encode_inode_list(&pairs, true, 512);
        let list = decode_inode_list(&buf).unwrap();
        assert!(list.clear);
        assert_eq!(list.inodes, pairs);

        let buf = encode_inode_list(&[], false, 512);
        let list = decode_inode_list(&buf).unwrap();
        assert!(!list.clear);
        assert!(list.inodes.is_empty());
    }

    #[test]
    fn test_pairs_per_block() {
        assert_eq!(blocks_per_list(512), 41);
        assert_eq!(inodes_per_list(512), 41);
        assert_eq!(blocks_per_list(4096), 340);
    }
}
