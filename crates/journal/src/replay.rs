//! Crash recovery: single-pass log replay.
//!
//! After an unclean shutdown the log holds some prefix of committed
//! transactions. [`Replay::start`] selects the newer of the two commit
//! headers and walks the ring from tail to head, folding every record into
//! an overlay map `filesystem block -> log offset` (last writer wins,
//! revocations remove). The filesystem then either queries the overlay
//! while mounting ([`can_read`]/[`read`]) or materializes it wholesale
//! with [`write`] before reopening the journal.
//!
//! [`can_read`]: Replay::can_read
//! [`read`]: Replay::read
//! [`write`]: Replay::write

use crate::config::LogLocation;
use crate::error::{ReplayError, ReplayResult};
use crate::format::{
    self, CommitHeader, RecordPrefix, BLOCKS_MAGIC, INODES_MAGIC, REVOKE_MAGIC,
};
use crate::ring::Ring;
use ringlog_core::{BlockDevice, BlockNo, PendingInode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Recovered log state.
pub struct Replay {
    dev: Arc<dyn BlockDevice>,
    log_start: u64,
    log_dev_bshift: u32,
    fs_dev_bshift: u32,
    ring: Ring,
    head: u64,
    tail: u64,
    generation: u64,
    log_id: [u8; 16],
    open: bool,
    blocks: HashMap<u64, u64>,
    inodes: Vec<PendingInode>,
    inodes_head: u64,
    inodes_tail: u64,
}

impl Replay {
    /// Read the log at `location` and reconstruct the overlay of its
    /// committed contents.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, on headers with bad magic or checksums, on
    /// geometry that does not describe this region, and on any
    /// malformed record in the committed range: a log that cannot be
    /// replayed safely must not be mounted.
    pub fn start(dev: Arc<dyn BlockDevice>, location: LogLocation) -> ReplayResult<Replay> {
        let block_size = location.block_size;
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(ReplayError::InvalidBlockSize(block_size));
        }
        let bshift = block_size.trailing_zeros();

        // Both ping-pong slots; at least one must decode, and the larger
        // generation wins.
        let mut slot = vec![0u8; block_size];
        dev.read_at(location.start_block, &mut slot)?;
        let first = CommitHeader::decode(&slot);
        dev.read_at(location.start_block + 1, &mut slot)?;
        let second = CommitHeader::decode(&slot);

        let header = match (first, second) {
            (Ok(a), Ok(b)) => {
                if b.generation > a.generation {
                    b
                } else {
                    a
                }
            }
            (Ok(a), Err(err)) | (Err(err), Ok(a)) => {
                warn!("one commit header slot unusable ({err}); using the other");
                a
            }
            (Err(err), Err(_)) => return Err(err),
        };

        if header.log_dev_bshift != bshift {
            return Err(ReplayError::BadGeometry(
                "stored log block size differs from the device's",
            ));
        }
        if header.fs_dev_bshift < header.log_dev_bshift {
            return Err(ReplayError::BadGeometry(
                "filesystem block size smaller than log block size",
            ));
        }
        if header.circ_size == 0
            || header.circ_off + header.circ_size > location.byte_len()
        {
            return Err(ReplayError::BadGeometry("ring exceeds the log region"));
        }
        let ring = Ring::new(header.circ_off, header.circ_size);
        if !ring.contains(header.head) || !ring.contains(header.tail) {
            return Err(ReplayError::BadGeometry("head or tail outside the ring"));
        }
        if (header.head == 0) != (header.tail == 0) {
            return Err(ReplayError::BadGeometry("half-empty head/tail pair"));
        }

        let used = ring.space_used(header.head, header.tail);
        debug!(
            generation = header.generation,
            head = header.head,
            tail = header.tail,
            used,
            "replaying log"
        );

        let mut replay = Replay {
            dev,
            log_start: location.start_block,
            log_dev_bshift: header.log_dev_bshift,
            fs_dev_bshift: header.fs_dev_bshift,
            ring,
            head: header.head,
            tail: header.tail,
            generation: header.generation,
            log_id: header.log_id,
            open: true,
            blocks: HashMap::with_capacity((used >> header.fs_dev_bshift) as usize),
            inodes: Vec::new(),
            inodes_head: 0,
            inodes_tail: 0,
        };
        replay.process()?;
        Ok(replay)
    }

    fn blocklen(&self) -> usize {
        1 << self.log_dev_bshift
    }

    fn fs_blocklen(&self) -> usize {
        1 << self.fs_dev_bshift
    }

    fn pbn_of(&self, off: u64) -> u64 {
        self.log_start + (off >> self.log_dev_bshift)
    }

    /// Read `buf.len()` bytes from ring offset `*off`, wrapping at the
    /// region end, and advance the cursor.
    fn circ_read(&self, buf: &mut [u8], off: &mut u64) -> ReplayResult<()> {
        debug_assert_eq!(buf.len() & (self.blocklen() - 1), 0);
        let mut pos = *off;
        if pos < self.ring.off() {
            pos = self.ring.off();
        }

        let until_end = (self.ring.off() + self.ring.size() - pos) as usize;
        let (first, rest) = if until_end < buf.len() {
            buf.split_at_mut(until_end)
        } else {
            buf.split_at_mut(buf.len())
        };
        self.dev.read_at(self.pbn_of(pos), first)?;
        if !rest.is_empty() {
            pos = self.ring.off();
            self.dev.read_at(self.pbn_of(pos), rest)?;
            pos += rest.len() as u64;
        } else {
            pos += first.len() as u64;
        }
        if pos >= self.ring.off() + self.ring.size() {
            pos = self.ring.off();
        }
        *off = pos;
        Ok(())
    }

    /// Advance a ring cursor without reading.
    fn circ_advance(&self, len: u64, off: &mut u64) {
        let mut pos = *off;
        if pos < self.ring.off() {
            pos = self.ring.off();
        }
        let until_end = self.ring.off() + self.ring.size() - pos;
        let len = if until_end < len {
            pos = self.ring.off();
            len - until_end
        } else {
            len
        };
        pos += len;
        if pos >= self.ring.off() + self.ring.size() {
            pos = self.ring.off();
        }
        *off = pos;
    }

    /// Walk every record between tail and head.
    fn process(&mut self) -> ReplayResult<()> {
        let blocklen = self.blocklen();
        let mut off = self.tail;
        let mut scratch = vec![0u8; blocklen];

        while off != self.head {
            let record_start = off;
            self.circ_read(&mut scratch, &mut off)?;
            let prefix = RecordPrefix::decode(&scratch);
            if prefix.len == 0 || prefix.len as usize % blocklen != 0 {
                return Err(ReplayError::CorruptRecords);
            }

            match prefix.magic {
                BLOCKS_MAGIC => self.process_blocks(&scratch, &mut off)?,
                REVOKE_MAGIC => self.process_revocations(&scratch)?,
                INODES_MAGIC => self.process_inodes(&scratch, record_start, off)?,
                other => return Err(ReplayError::UnknownRecord(other)),
            }

            // Each record's stored length must agree with how far its
            // payload actually carried the cursor.
            let mut expected = record_start;
            self.circ_advance(prefix.len as u64, &mut expected);
            if expected != off {
                return Err(ReplayError::CorruptRecords);
            }
        }
        debug!(
            overlaid = self.blocks.len(),
            pending_inodes = self.inodes.len(),
            "replay scan complete"
        );
        Ok(())
    }

    fn process_blocks(&mut self, scratch: &[u8], off: &mut u64) -> ReplayResult<()> {
        let fs_blocklen = self.fs_blocklen() as u64;
        let pairs = format::decode_block_list(scratch)?;
        for (daddr, dlen) in pairs {
            // Each filesystem-block unit of the payload gets its own
            // overlay entry, so later (partial) writes of the same range
            // override correctly.
            let units = (dlen as u64) >> self.fs_dev_bshift;
            for j in 0..units {
                self.blocks.insert(daddr + j, *off);
                self.circ_advance(fs_blocklen, off);
            }
        }
        Ok(())
    }

    fn process_revocations(&mut self, scratch: &[u8]) -> ReplayResult<()> {
        let pairs = format::decode_block_list(scratch)?;
        for (daddr, dlen) in pairs {
            let units = (dlen as u64) >> self.fs_dev_bshift;
            for j in 0..units {
                self.blocks.remove(&(daddr + j));
            }
        }
        Ok(())
    }

    fn process_inodes(
        &mut self,
        scratch: &[u8],
        record_start: u64,
        new_off: u64,
    ) -> ReplayResult<()> {
        let list = format::decode_inode_list(scratch)?;
        if list.clear {
            // This record subsumes everything before it; remember where
            // the live list starts so a reopened journal can keep it.
            self.inodes_tail = record_start;
            self.inodes.clear();
        }
        self.inodes_head = new_off;
        for (inode, mode) in list.inodes {
            self.inodes.push(PendingInode { inode, mode });
        }
        Ok(())
    }

    /// True if the committed log contains no records.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True if any filesystem block in `[block, block + len)` is
    /// overridden by the log. `len` is in bytes.
    pub fn can_read(&self, block: BlockNo, len: u32) -> bool {
        debug_assert_eq!(len as usize % self.fs_blocklen(), 0);
        let units = (len as u64) >> self.fs_dev_bshift;
        (0..units).any(|j| self.blocks.contains_key(&(block.0 + j)))
    }

    /// Copy logged contents over `dest` for every overridden filesystem
    /// block in the range starting at `block`. Non-overridden parts of
    /// `dest` are left untouched; the caller fills them from the live
    /// device first. `dest.len()` must be a filesystem-block multiple.
    ///
    /// # Errors
    ///
    /// Fails on log device I/O errors.
    pub fn read(&self, dest: &mut [u8], block: BlockNo) -> ReplayResult<()> {
        let fs_blocklen = self.fs_blocklen();
        debug_assert_eq!(dest.len() % fs_blocklen, 0);
        for (j, unit) in dest.chunks_mut(fs_blocklen).enumerate() {
            if let Some(&log_off) = self.blocks.get(&(block.0 + j as u64)) {
                let mut off = log_off;
                self.circ_read(unit, &mut off)?;
            }
        }
        Ok(())
    }

    /// Materialize the whole overlay onto the filesystem device: the
    /// roll-forward that makes the filesystem consistent. Write order is
    /// irrelevant; last-writer-wins was already resolved into the overlay
    /// during the scan.
    ///
    /// # Errors
    ///
    /// Fails on the first I/O error, leaving the remaining blocks
    /// unwritten (the pass can simply run again).
    pub fn write(&self, fs_dev: &dyn BlockDevice) -> ReplayResult<()> {
        let fs_blocklen = self.fs_blocklen();
        debug_assert_eq!(fs_dev.block_size(), fs_blocklen);
        let mut unit = vec![0u8; fs_blocklen];
        for (&blk, &log_off) in &self.blocks {
            let mut off = log_off;
            self.circ_read(&mut unit, &mut off)?;
            fs_dev.write_at(blk, &unit)?;
        }
        debug!(blocks = self.blocks.len(), "replay materialized");
        Ok(())
    }

    /// Drop the overlay. Pending inodes remain available so a reopened
    /// journal can adopt them.
    pub fn stop(&mut self) {
        self.open = false;
        self.blocks.clear();
    }

    /// Whether [`stop`](Replay::stop) has not been called yet.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The allocated-but-unlinked inodes as of the last committed record.
    pub fn pending_inodes(&self) -> &[PendingInode] {
        &self.inodes
    }

    /// Ring window `(head, tail)` occupied by the live pending-inode
    /// list, for a reopening journal to build on.
    pub fn inode_window(&self) -> (u64, u64) {
        (self.inodes_head, self.inodes_tail)
    }

    /// Number of filesystem blocks the log overrides.
    pub fn overlay_len(&self) -> usize {
        self.blocks.len()
    }

    /// The overridden filesystem block numbers, sorted.
    pub fn overlaid_blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.blocks.keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }

    /// Recovered ring head.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Recovered ring tail.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Generation of the winning commit header.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identity stamped into the log's commit headers.
    pub fn log_id(&self) -> [u8; 16] {
        self.log_id
    }

    /// Ring region start.
    pub fn circ_off(&self) -> u64 {
        self.ring.off()
    }

    /// Ring region size.
    pub fn circ_size(&self) -> u64 {
        self.ring.size()
    }

    /// log2 of the log device block size.
    pub fn log_dev_bshift(&self) -> u32 {
        self.log_dev_bshift
    }

    /// log2 of the filesystem block size.
    pub fn fs_dev_bshift(&self) -> u32 {
        self.fs_dev_bshift
    }
}
