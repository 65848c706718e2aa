//! Journal configuration.
//!
//! Everything the original tied to host memory statistics or global tunables
//! is an explicit field here, supplied by the embedding filesystem.

use crate::error::ConfigError;

/// Location of the log region on its device.
///
/// Two blocks at `start_block` are reserved for the ping-pong commit
/// headers; the circular data region follows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLocation {
    /// First device block of the log region (commit header slot 0).
    pub start_block: u64,
    /// Total length of the region in device blocks, headers included.
    pub block_count: u64,
    /// Log device block size in bytes. Must be a power of two >= 512 and
    /// no larger than the filesystem block size.
    pub block_size: usize,
}

impl LogLocation {
    /// Describe a log region.
    pub fn new(start_block: u64, block_count: u64, block_size: usize) -> Self {
        LogLocation {
            start_block,
            block_count,
            block_size,
        }
    }

    /// Region length in bytes.
    pub fn byte_len(&self) -> u64 {
        self.block_count * self.block_size as u64
    }
}

/// Journal configuration parameters.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Soft ceiling on accumulated buffer bytes before `begin` forces a
    /// flush at 50% occupancy (default: 16 MiB). Capped at the ring size
    /// when the journal opens.
    pub max_transaction_bytes: usize,

    /// Soft ceiling on the accumulated buffer count (default: 8192).
    pub max_transaction_buffers: usize,

    /// Capacity of the pending-deallocation list (default: 2048).
    /// Registration fails with a retryable error once full.
    pub dealloc_limit: usize,

    /// Size of the write-coalescing staging buffer and the largest single
    /// device transfer, in bytes (default: 64 KiB). Power of two.
    pub max_transfer: usize,

    /// Issue a device cache flush before and after each commit header
    /// write (default: true). Disabling this trades crash safety on
    /// devices with volatile write caches for speed.
    pub flush_disk_cache: bool,

    /// Opportunistically advance the tail over already-reclaimed bytes
    /// during each flush (default: true), shrinking later truncate stalls.
    pub eager_reclaim: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            max_transaction_bytes: 16 * 1024 * 1024,
            max_transaction_buffers: 8192,
            dealloc_limit: 2048,
            max_transfer: 64 * 1024,
            flush_disk_cache: true,
            eager_reclaim: true,
        }
    }
}

impl JournalConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accumulator byte ceiling (builder pattern).
    pub fn with_max_transaction_bytes(mut self, bytes: usize) -> Self {
        self.max_transaction_bytes = bytes;
        self
    }

    /// Set the accumulator buffer-count ceiling (builder pattern).
    pub fn with_max_transaction_buffers(mut self, count: usize) -> Self {
        self.max_transaction_buffers = count;
        self
    }

    /// Set the pending-deallocation list capacity (builder pattern).
    pub fn with_dealloc_limit(mut self, limit: usize) -> Self {
        self.dealloc_limit = limit;
        self
    }

    /// Set the staging-buffer / max transfer size (builder pattern).
    pub fn with_max_transfer(mut self, bytes: usize) -> Self {
        self.max_transfer = bytes;
        self
    }

    /// Enable or disable commit-time device cache flushes (builder pattern).
    pub fn with_flush_disk_cache(mut self, on: bool) -> Self {
        self.flush_disk_cache = on;
        self
    }

    /// Enable or disable opportunistic tail advancement (builder pattern).
    pub fn with_eager_reclaim(mut self, on: bool) -> Self {
        self.eager_reclaim = on;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_transfer < 512 || !self.max_transfer.is_power_of_two() {
            return Err(ConfigError::BadMaxTransfer);
        }
        if self.max_transaction_bytes < self.max_transfer {
            return Err(ConfigError::TransactionCeilingTooSmall);
        }
        if self.max_transaction_buffers == 0 {
            return Err(ConfigError::ZeroLimit("max_transaction_buffers"));
        }
        if self.dealloc_limit == 0 {
            return Err(ConfigError::ZeroLimit("dealloc_limit"));
        }
        Ok(())
    }

    /// A configuration sized for tests: small ring-relative ceilings and a
    /// small transfer unit so coalescing boundaries are exercised.
    pub fn for_testing() -> Self {
        JournalConfig {
            max_transaction_bytes: 64 * 1024,
            max_transaction_buffers: 64,
            dealloc_limit: 16,
            max_transfer: 4 * 1024,
            flush_disk_cache: true,
            eager_reclaim: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(JournalConfig::default().validate().is_ok());
        assert!(JournalConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = JournalConfig::new()
            .with_max_transaction_bytes(1 << 20)
            .with_dealloc_limit(32)
            .with_eager_reclaim(false);
        assert_eq!(config.max_transaction_bytes, 1 << 20);
        assert_eq!(config.dealloc_limit, 32);
        assert!(!config.eager_reclaim);
    }

    #[test]
    fn test_validation_rejects_bad_transfer() {
        let config = JournalConfig::new().with_max_transfer(3000);
        assert_eq!(config.validate(), Err(ConfigError::BadMaxTransfer));

        let config = JournalConfig::new().with_max_transfer(256);
        assert_eq!(config.validate(), Err(ConfigError::BadMaxTransfer));
    }

    #[test]
    fn test_validation_rejects_small_ceiling() {
        let config = JournalConfig::new()
            .with_max_transfer(64 * 1024)
            .with_max_transaction_bytes(1024);
        assert_eq!(
            config.validate(),
            Err(ConfigError::TransactionCeilingTooSmall)
        );
    }

    #[test]
    fn test_location_byte_len() {
        assert_eq!(LogLocation::new(0, 128, 512).byte_len(), 65536);
    }
}
