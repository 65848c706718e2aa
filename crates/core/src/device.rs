//! Collaborator traits: the block device, the buffer cache, and the
//! filesystem flush hooks.
//!
//! The journal is filesystem-agnostic. Everything it needs from the outside
//! world arrives through these three traits; the engine itself performs no
//! file or device I/O of its own.

use crate::types::{BufferId, Deallocation};
use parking_lot::Mutex;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Synchronous block-granular I/O on a single device.
///
/// Addresses (`pbn`) are in units of the device's block size; data lengths
/// must be block-size multiples. `cache_flush` is the write barrier the
/// commit protocol depends on: when it returns, every previously written
/// block is on stable storage.
pub trait BlockDevice: Send + Sync {
    /// Block size of this device in bytes.
    fn block_size(&self) -> usize;

    /// Read `buf.len()` bytes starting at block `pbn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn read_at(&self, pbn: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` starting at block `pbn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    fn write_at(&self, pbn: u64, data: &[u8]) -> io::Result<()>;

    /// Force all completed writes to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the barrier cannot be issued.
    fn cache_flush(&self) -> io::Result<()>;
}

/// Completion callback for an asynchronous buffer write.
///
/// Invoked exactly once, from whatever context finishes the I/O.
pub type WriteCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

/// The external owner of dirty buffers.
///
/// The journal pins buffers by id and queries this trait for their
/// metadata and payload. When a transaction commits, the journal hands each
/// buffer back via [`start_write`](BufferCache::start_write); the cache
/// writes it to its home location on the filesystem device and fires the
/// completion, which is how the journal learns the logged bytes have become
/// redundant and reclaimable.
pub trait BufferCache: Send + Sync {
    /// Filesystem block number the buffer will be written to.
    fn disk_block(&self, buf: BufferId) -> u64;

    /// Allocation footprint of the buffer in bytes (may be rounded up by
    /// the cache, e.g. to page size). Used for admission accounting.
    fn mem_size(&self, buf: BufferId) -> usize;

    /// Bytes of valid data that will be logged and written. Always a
    /// filesystem-block multiple.
    fn io_size(&self, buf: BufferId) -> usize;

    /// Snapshot of the buffer's payload, `io_size` bytes long.
    fn data(&self, buf: BufferId) -> Vec<u8>;

    /// Begin writing the buffer to its home location. `done` fires exactly
    /// once with the outcome; it may fire before this call returns.
    fn start_write(&self, buf: BufferId, done: WriteCompletion);

    /// Release a pinned buffer without writing it (discard path).
    fn release(&self, buf: BufferId);
}

/// Filesystem callbacks invoked around a commit.
///
/// `flush_deallocations` runs at the start of every flush, before the
/// pending deallocations are logged, letting the filesystem externalize its
/// own metadata for them first. `flush_aborted` runs if the flush fails
/// after that point so those changes can be rolled back.
pub trait FlushHooks: Send + Sync {
    /// Called at the start of flush with the pending deallocation list.
    fn flush_deallocations(&self, deallocs: &[Deallocation]);

    /// Called when a flush fails after `flush_deallocations` ran.
    fn flush_aborted(&self, deallocs: &[Deallocation]);
}

/// Hooks implementation for embedders with no commit-synchronized state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl FlushHooks for NoopHooks {
    fn flush_deallocations(&self, _deallocs: &[Deallocation]) {}
    fn flush_aborted(&self, _deallocs: &[Deallocation]) {}
}

/// A [`BlockDevice`] backed by a regular file (or a raw device node).
///
/// Suitable for user-space tooling and tests; `cache_flush` maps to
/// `sync_data`.
pub struct FileDevice {
    file: Mutex<File>,
    block_size: usize,
}

impl FileDevice {
    /// Open `path` read-write as a block device with the given block size.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, block_size: usize) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(FileDevice {
            file: Mutex::new(file),
            block_size,
        })
    }

    /// Wrap an already-open file.
    pub fn from_file(file: File, block_size: usize) -> Self {
        FileDevice {
            file: Mutex::new(file),
            block_size,
        }
    }

    fn byte_offset(&self, pbn: u64) -> u64 {
        pbn * self.block_size as u64
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_at(&self, pbn: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.byte_offset(pbn)))?;
        file.read_exact(buf)
    }

    fn write_at(&self, pbn: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.byte_offset(pbn)))?;
        file.write_all(data)
    }

    fn cache_flush(&self) -> io::Result<()> {
        let file = self.file.lock();
        file.sync_data()
    }
}
