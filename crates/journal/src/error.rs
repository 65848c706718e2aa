//! Error types for the journal engine.
//!
//! Two families: [`JournalError`] for the runtime engine and
//! [`ReplayError`] for the mount-time recovery pass. Both are plain
//! `thiserror` enums; nothing in the engine panics on a runtime path.

use std::io;
use thiserror::Error;

/// Result alias for journal operations.
pub type JournalResult<T> = std::result::Result<T, JournalError>;

/// Result alias for replay operations.
pub type ReplayResult<T> = std::result::Result<T, ReplayError>;

/// Errors surfaced by the runtime journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// A device read or write failed.
    #[error("log device I/O error: {0}")]
    Io(#[from] io::Error),

    /// A previous buffer write failed and the journal can no longer
    /// guarantee durable commits. Only `discard` clears this state.
    #[error("journal is in a persistent error state; discard required")]
    LogFailed,

    /// The accumulated transaction cannot fit in the log ring.
    ///
    /// The caller can split the transaction or flush more often; the
    /// accumulator is left intact.
    #[error("transaction of {size} bytes exceeds log capacity of {capacity} bytes")]
    TransactionTooLarge {
        /// Bytes the transaction would occupy on disk.
        size: u64,
        /// Ring capacity minus the reserved pending-inode footprint.
        capacity: u64,
    },

    /// The pending-deallocation list is full.
    ///
    /// Retryable: a `flush` drains the list.
    #[error("pending deallocation list is full ({limit} entries); flush and retry")]
    DeallocationLimitExceeded {
        /// Configured list capacity.
        limit: usize,
    },

    /// A buffer or deallocation length is not a filesystem-block multiple.
    #[error("length {len} is not a multiple of the filesystem block size {block_size}")]
    Misaligned {
        /// Offending length in bytes.
        len: usize,
        /// Filesystem block size in bytes.
        block_size: usize,
    },

    /// The log region described at open time is not usable.
    #[error("invalid log geometry: {0}")]
    InvalidGeometry(&'static str),

    /// A prior replay handed to `open` does not describe this log.
    #[error("replay state does not match log geometry: {0}")]
    ReplayMismatch(&'static str),

    /// Close was requested while inodes are still pending, without `force`.
    #[error("{count} allocated-but-unlinked inodes still pending")]
    PendingInodes {
        /// Number of inodes still registered.
        count: usize,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors detected while validating a [`JournalConfig`].
///
/// [`JournalConfig`]: crate::config::JournalConfig
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `max_transfer` must be a power of two of at least 512 bytes.
    #[error("max_transfer must be a power of two >= 512")]
    BadMaxTransfer,

    /// The accumulator ceiling cannot be smaller than one transfer unit.
    #[error("max_transaction_bytes must be at least max_transfer")]
    TransactionCeilingTooSmall,

    /// Limits must be nonzero.
    #[error("{0} must be nonzero")]
    ZeroLimit(&'static str),
}

/// Errors surfaced by the replay engine.
///
/// All of these are fatal to the replay pass: the mount path must refuse to
/// mount rather than risk replaying a corrupt log.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// A device read or write failed.
    #[error("log device I/O error during replay: {0}")]
    Io(#[from] io::Error),

    /// Neither commit-header slot carried the expected magic.
    #[error("unrecognized commit header magic 0x{0:08x}")]
    BadMagic(u32),

    /// The selected commit header failed its checksum.
    #[error("commit header checksum mismatch (stored 0x{stored:08x}, computed 0x{computed:08x})")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        stored: u32,
        /// Checksum computed over the header block.
        computed: u32,
    },

    /// A record in the log stream carried an unknown type tag.
    #[error("unrecognized log record type 0x{0:08x}")]
    UnknownRecord(u32),

    /// Record lengths did not tile the scanned region exactly.
    #[error("corrupted log records: record length disagrees with stream position")]
    CorruptRecords,

    /// The stored geometry is self-inconsistent or out of range.
    #[error("invalid log geometry in commit header: {0}")]
    BadGeometry(&'static str),

    /// The block size passed to `Replay::start` is unusable.
    #[error("invalid log block size {0}")]
    InvalidBlockSize(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JournalError::TransactionTooLarge {
            size: 9000,
            capacity: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("8192"));

        let err = JournalError::DeallocationLimitExceeded { limit: 16 };
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err: JournalError = io_err.into();
        assert!(matches!(err, JournalError::Io(_)));
    }
}
