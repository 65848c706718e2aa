//! The journal engine.
//!
//! A [`Journal`] owns one circular log region and the in-memory state of
//! the currently accumulating transaction: pinned buffers, pending block
//! deallocations, and pending (allocated-but-unlinked) inodes. `flush`
//! drains the accumulator into the log as BLOCKS / REVOCATIONS / INODES
//! records, commits them with a ping-pong header write, and hands the
//! buffers to the cache for asynchronous writeback; ring space is reclaimed
//! strictly in commit order as those writebacks complete.
//!
//! # Locking
//!
//! Three levels, mirroring the lock legend of the transaction model:
//!
//! - `txn_lock` (RwLock): readers are open transactions (`begin`..`end`),
//!   the writer is `flush`/`discard`. Flush waits for every open
//!   transaction to end; no new transaction opens during a flush.
//! - `state` (Mutex): all accumulator counters, the pending lists and the
//!   entry FIFO. Held only for O(1) mutations, never across I/O.
//! - `writer` (Mutex over the coalescer): touched only while holding the
//!   `txn_lock` writer side, where it wraps the actual device writes.
//!
//! `space_cv` signals "reclaimable bytes grew" from completion context to
//! a blocked `truncate`.

use crate::coalesce::Coalescer;
use crate::config::{JournalConfig, LogLocation};
use crate::error::{JournalError, JournalResult};
use crate::format::{
    self, CommitHeader, BLOCKS_MAGIC, REVOKE_MAGIC,
};
use crate::replay::Replay;
use crate::ring::Ring;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use ringlog_core::{
    BlockDevice, BlockNo, BufferCache, BufferId, Deallocation, FlushHooks,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};
use uuid::Uuid;

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Per-mount journal handle.
///
/// Cheap to clone; all clones share the same engine state.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

/// An open transaction.
///
/// Holds the shared side of the transaction lock; buffer and inode
/// registration go through this guard. Dropping it (or calling
/// [`end`](Transaction::end)) closes the transaction, allowing a
/// concurrent `flush` to proceed once all transactions are closed.
pub struct Transaction<'a> {
    journal: &'a Journal,
    _guard: RwLockReadGuard<'a, ()>,
}

/// A point-in-time snapshot of the engine's accounting, for observability
/// and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    /// Ring head offset (0 = empty).
    pub head: u64,
    /// Ring tail offset (0 = empty).
    pub tail: u64,
    /// Bytes occupied in the ring.
    pub space_used: u64,
    /// Bytes free in the ring.
    pub space_free: u64,
    /// Accumulated buffer allocation bytes.
    pub bufbytes: usize,
    /// Accumulated buffer count.
    pub bufcount: usize,
    /// Accumulated buffer I/O bytes (what a flush would log).
    pub bcount: usize,
    /// Pending deallocations.
    pub dealloc_count: usize,
    /// Pending inodes.
    pub inode_count: usize,
    /// Bytes reclaimable by the next truncate.
    pub reclaimable_bytes: u64,
    /// Bytes reserved for the on-disk pending-inode list.
    pub reserved_bytes: u64,
    /// Flushed-but-not-fully-synced transactions in flight.
    pub entries: usize,
    /// Sticky error count; nonzero means the journal is failed.
    pub error_count: u32,
    /// Next commit header generation.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct BufMeta {
    blk: u64,
    mem: usize,
    io: usize,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    bufcount: usize,
    reclaimable_bytes: u64,
    error: bool,
}

struct State {
    head: u64,
    tail: u64,
    generation: u64,
    open_txns: usize,
    bufs: BTreeMap<BufferId, BufMeta>,
    bufbytes: usize,
    bufcount: usize,
    bcount: usize,
    deallocs: Vec<Deallocation>,
    inodes: HashMap<u64, u32>,
    entries: VecDeque<Entry>,
    reclaimable: u64,
    reserved: u64,
    error_count: u32,
    next_entry_id: u64,
}

struct Inner {
    dev: Arc<dyn BlockDevice>,
    cache: Arc<dyn BufferCache>,
    hooks: Arc<dyn FlushHooks>,
    self_weak: Weak<Inner>,

    log_start: u64,
    log_dev_bshift: u32,
    fs_dev_bshift: u32,
    ring: Ring,
    log_id: [u8; 16],

    bufbytes_max: usize,
    bufcount_max: usize,
    dealloc_limit: usize,
    max_transfer: usize,
    flush_disk_cache: bool,
    eager_reclaim: bool,

    txn_lock: RwLock<()>,
    state: Mutex<State>,
    space_cv: Condvar,
    writer: Mutex<Coalescer>,
}

impl Journal {
    /// Open a journal over the given log region.
    ///
    /// If `replay` carries pending inodes recovered from a previous mount,
    /// they are carried into the new log: the inode list is re-registered,
    /// written at the recovered list position, and its footprint stays
    /// reserved so no transaction can overwrite it. The commit header
    /// generation continues past the recovered one.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or geometry, on a replay that does
    /// not match this log, and on device I/O errors while writing the
    /// initial commit header.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        cache: Arc<dyn BufferCache>,
        hooks: Arc<dyn FlushHooks>,
        location: LogLocation,
        config: JournalConfig,
        replay: Option<&Replay>,
    ) -> JournalResult<Journal> {
        config.validate()?;

        let block_size = location.block_size;
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(JournalError::InvalidGeometry(
                "log block size must be a power of two of at least 512",
            ));
        }
        let log_dev_bshift = block_size.trailing_zeros();
        let fs_dev_bshift = log_dev_bshift;

        if config.max_transfer < block_size {
            return Err(JournalError::InvalidGeometry(
                "transfer unit smaller than the log block size",
            ));
        }
        if location.byte_len() < config.max_transfer as u64 {
            return Err(JournalError::InvalidGeometry(
                "log region smaller than one transfer unit",
            ));
        }

        // Two blocks ahead of the ring hold the ping-pong commit headers.
        let circ_off = 2 * block_size as u64;
        if location.byte_len() <= circ_off + block_size as u64 {
            return Err(JournalError::InvalidGeometry(
                "log region leaves no room for the ring",
            ));
        }
        let mut circ_size = location.byte_len() - circ_off;
        circ_size = (circ_size >> log_dev_bshift) << log_dev_bshift;
        let ring = Ring::new(circ_off, circ_size);

        // The in-memory transaction ceiling can never usefully exceed the
        // ring, and must tile into device and filesystem blocks.
        let mut bufbytes_max = config.max_transaction_bytes.min(circ_size as usize);
        bufbytes_max >>= fs_dev_bshift;
        bufbytes_max <<= fs_dev_bshift;

        let inner = Arc::new_cyclic(|self_weak| Inner {
            dev: device,
            cache,
            hooks,
            self_weak: self_weak.clone(),
            log_start: location.start_block,
            log_dev_bshift,
            fs_dev_bshift,
            ring,
            log_id: *Uuid::new_v4().as_bytes(),
            bufbytes_max,
            bufcount_max: config.max_transaction_buffers,
            dealloc_limit: config.dealloc_limit,
            max_transfer: config.max_transfer,
            flush_disk_cache: config.flush_disk_cache,
            eager_reclaim: config.eager_reclaim,
            txn_lock: RwLock::new(()),
            state: Mutex::new(State {
                head: 0,
                tail: 0,
                generation: 0,
                open_txns: 0,
                bufs: BTreeMap::new(),
                bufbytes: 0,
                bufcount: 0,
                bcount: 0,
                deallocs: Vec::new(),
                inodes: HashMap::new(),
                entries: VecDeque::new(),
                reclaimable: 0,
                reserved: 0,
                error_count: 0,
                next_entry_id: 0,
            }),
            space_cv: Condvar::new(),
            writer: Mutex::new(Coalescer::new(config.max_transfer, log_dev_bshift)),
        });

        if let Some(wr) = replay {
            if !wr.pending_inodes().is_empty() {
                inner.adopt_replay_inodes(wr)?;
            }
        }

        let (head, tail) = {
            let st = inner.state.lock();
            (st.head, st.tail)
        };
        inner.write_commit(head, tail)?;

        debug!(
            circ_off,
            circ_size,
            block_size,
            "journal opened"
        );
        Ok(Journal { inner })
    }

    /// Open a transaction.
    ///
    /// If the accumulator has crossed half of any admission threshold
    /// (bytes, buffer count, projected log footprint, pending
    /// deallocations), a synchronous `flush(false)` runs first; `begin`
    /// fails only if that flush fails.
    ///
    /// # Errors
    ///
    /// Propagates a forced-flush failure.
    pub fn begin(&self) -> JournalResult<Transaction<'_>> {
        let inner = &self.inner;
        let doflush = {
            let st = inner.state.lock();
            let lockcount = st.open_txns;
            st.bufbytes + lockcount * inner.max_transfer > inner.bufbytes_max / 2
                || st.bufcount + lockcount * 10 > inner.bufcount_max / 2
                || inner.transaction_len(&st) > inner.ring.size() / 2
                || st.deallocs.len() >= inner.dealloc_limit / 2
        };

        if doflush {
            debug!("admission threshold crossed; flushing before new transaction");
            self.flush(false)?;
        }

        let guard = inner.txn_lock.read();
        inner.state.lock().open_txns += 1;
        Ok(Transaction {
            journal: self,
            _guard: guard,
        })
    }

    /// Flush the accumulated transaction to the log and start writeback.
    ///
    /// With `wait` set, additionally blocks until the ring drains to at
    /// most the reserved pending-inode footprint. Must not be called while
    /// this thread holds an open [`Transaction`]: flush takes the
    /// exclusive side of the transaction lock.
    ///
    /// # Errors
    ///
    /// Returns device errors, `TransactionTooLarge`, or `LogFailed` once
    /// the journal is in the sticky error state. On error the accumulator
    /// is left intact and the abort hook has been invoked.
    pub fn flush(&self, wait: bool) -> JournalResult<()> {
        let inner = &self.inner;

        if !wait {
            let st = inner.state.lock();
            debug_assert_eq!(st.bufcount == 0, st.bufbytes == 0);
            debug_assert_eq!(st.bufcount == 0, st.bcount == 0);
            if st.bufcount == 0 {
                return Ok(());
            }
        }

        let _w = inner.txn_lock.write();
        let result = inner.flush_locked(wait);
        if let Err(err) = &result {
            warn!("flush aborted: {err}");
            let deallocs = inner.state.lock().deallocs.clone();
            inner.hooks.flush_aborted(&deallocs);
        }
        result
    }

    /// Throw away the accumulated transaction and all in-flight entries.
    ///
    /// The emergency unwind for a journal that can no longer make
    /// progress: pinned buffers are released back to the cache unwritten,
    /// the pending lists and the entry FIFO are cleared, and the sticky
    /// error state is reset. Log contents already committed are untouched.
    pub fn discard(&self) {
        let inner = &self.inner;
        let _w = inner.txn_lock.write();

        let deallocs = inner.state.lock().deallocs.clone();
        inner.hooks.flush_deallocations(&deallocs);

        let buf_ids: Vec<BufferId> = {
            let mut st = inner.state.lock();
            warn!(
                bufcount = st.bufcount,
                deallocs = st.deallocs.len(),
                inodes = st.inodes.len(),
                entries = st.entries.len(),
                "discarding journal transaction"
            );
            let ids = st.bufs.keys().copied().collect();
            st.bufs.clear();
            st.bufbytes = 0;
            st.bufcount = 0;
            st.bcount = 0;
            st.deallocs.clear();
            st.inodes.clear();
            st.entries.clear();
            st.error_count = 0;
            ids
        };

        for id in buf_ids {
            inner.cache.release(id);
        }
    }

    /// Flush and shut down.
    ///
    /// With `force`, a failed flush or a non-empty pending-inode set is
    /// discarded instead of reported.
    ///
    /// # Errors
    ///
    /// Without `force`: the flush error, or `PendingInodes` if unlinked
    /// inodes survive the flush (they persist until the filesystem
    /// releases them).
    pub fn close(self, force: bool) -> JournalResult<()> {
        if let Err(err) = self.flush(true) {
            if !force {
                return Err(err);
            }
            warn!("flush during close failed ({err}); discarding");
            self.discard();
        }

        let pending = self.inner.state.lock().inodes.len();
        if pending > 0 {
            if !force {
                return Err(JournalError::PendingInodes { count: pending });
            }
            self.discard();
        }

        let st = self.inner.state.lock();
        debug_assert_eq!(st.bufcount, 0);
        debug_assert!(st.deallocs.is_empty());
        debug_assert!(st.inodes.is_empty());
        Ok(())
    }

    /// Current accounting snapshot.
    pub fn stats(&self) -> JournalStats {
        let inner = &self.inner;
        let st = inner.state.lock();
        JournalStats {
            head: st.head,
            tail: st.tail,
            space_used: inner.ring.space_used(st.head, st.tail),
            space_free: inner.ring.space_free(st.head, st.tail),
            bufbytes: st.bufbytes,
            bufcount: st.bufcount,
            bcount: st.bcount,
            dealloc_count: st.deallocs.len(),
            inode_count: st.inodes.len(),
            reclaimable_bytes: st.reclaimable,
            reserved_bytes: st.reserved,
            entries: st.entries.len(),
            error_count: st.error_count,
            generation: st.generation,
        }
    }

    /// Filesystem block size this journal validates buffer lengths against.
    pub fn fs_block_size(&self) -> usize {
        1 << self.inner.fs_dev_bshift
    }
}

impl Transaction<'_> {
    /// Close the transaction. Equivalent to dropping the guard.
    pub fn end(self) {}

    /// Pin a dirty buffer to the current transaction.
    ///
    /// Re-adding an already pinned buffer is a no-op for the accounting.
    /// The buffer's I/O size must be a filesystem-block multiple.
    ///
    /// # Errors
    ///
    /// `Misaligned` if the buffer length does not tile into filesystem
    /// blocks.
    pub fn add_buf(&self, buf: BufferId) -> JournalResult<()> {
        let inner = &self.journal.inner;
        let fs_block = 1usize << inner.fs_dev_bshift;
        let meta = BufMeta {
            blk: inner.cache.disk_block(buf),
            mem: inner.cache.mem_size(buf),
            io: inner.cache.io_size(buf),
        };
        if meta.io == 0 || meta.io % fs_block != 0 {
            return Err(JournalError::Misaligned {
                len: meta.io,
                block_size: fs_block,
            });
        }

        let mut st = inner.state.lock();
        if st.bufs.insert(buf, meta).is_none() {
            st.bufbytes += meta.mem;
            st.bcount += meta.io;
            st.bufcount += 1;
            trace!(%buf, bytes = meta.io, "buffer pinned to transaction");
        } else {
            trace!(%buf, "buffer re-pinned");
        }
        Ok(())
    }

    /// Unpin a buffer, e.g. because the cache invalidated it before it was
    /// ever flushed. Unknown buffers are ignored.
    pub fn remove_buf(&self, buf: BufferId) {
        let inner = &self.journal.inner;
        let mut st = inner.state.lock();
        if let Some(meta) = st.bufs.remove(&buf) {
            debug_assert!(st.bufbytes >= meta.mem && st.bcount >= meta.io && st.bufcount > 0);
            st.bufbytes -= meta.mem;
            st.bcount -= meta.io;
            st.bufcount -= 1;
            trace!(%buf, "buffer unpinned from transaction");
        }
    }

    /// Re-read a pinned buffer's sizes after the cache resized it,
    /// keeping the accumulator totals accurate. `old_mem`/`old_io` are the
    /// sizes it had when pinned. Ignored for unpinned buffers.
    ///
    /// # Errors
    ///
    /// `Misaligned` if the new I/O size does not tile into filesystem
    /// blocks.
    pub fn resize_buf(&self, buf: BufferId, old_mem: usize, old_io: usize) -> JournalResult<()> {
        let inner = &self.journal.inner;
        let fs_block = 1usize << inner.fs_dev_bshift;
        let new_mem = inner.cache.mem_size(buf);
        let new_io = inner.cache.io_size(buf);
        if new_io == 0 || new_io % fs_block != 0 {
            return Err(JournalError::Misaligned {
                len: new_io,
                block_size: fs_block,
            });
        }

        let mut st = inner.state.lock();
        if let Some(meta) = st.bufs.get_mut(&buf) {
            meta.mem = new_mem;
            meta.io = new_io;
            st.bufbytes = st.bufbytes - old_mem + new_mem;
            st.bcount = st.bcount - old_io + new_io;
        }
        Ok(())
    }

    /// Queue a block-range deallocation for the next commit.
    ///
    /// # Errors
    ///
    /// `Misaligned` for lengths that do not tile into filesystem blocks;
    /// `DeallocationLimitExceeded` when the list is full; flush and
    /// retry.
    pub fn register_deallocation(&self, block: BlockNo, len: u32) -> JournalResult<()> {
        let inner = &self.journal.inner;
        let fs_block = 1u32 << inner.fs_dev_bshift;
        if len == 0 || len % fs_block != 0 {
            return Err(JournalError::Misaligned {
                len: len as usize,
                block_size: fs_block as usize,
            });
        }

        let mut st = inner.state.lock();
        if st.deallocs.len() >= inner.dealloc_limit {
            return Err(JournalError::DeallocationLimitExceeded {
                limit: inner.dealloc_limit,
            });
        }
        st.deallocs.push(Deallocation { block, len });
        trace!(%block, len, "deallocation registered");
        Ok(())
    }

    /// Track an allocated-but-unlinked inode. No-op if already tracked.
    pub fn register_inode(&self, inode: u64, mode: u32) {
        let mut st = self.journal.inner.state.lock();
        if st.inodes.insert(inode, mode).is_none() {
            trace!(inode, "inode registered");
        }
    }

    /// Stop tracking an inode, e.g. once its last reference is gone and
    /// the filesystem has freed it. No-op if not tracked.
    pub fn unregister_inode(&self, inode: u64) {
        let mut st = self.journal.inner.state.lock();
        if st.inodes.remove(&inode).is_some() {
            trace!(inode, "inode unregistered");
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let mut st = self.journal.inner.state.lock();
        debug_assert!(st.open_txns > 0);
        st.open_txns -= 1;
    }
}

impl Inner {
    fn blocklen(&self) -> usize {
        1 << self.log_dev_bshift
    }

    fn pbn_of(&self, off: u64) -> u64 {
        self.log_start + (off >> self.log_dev_bshift)
    }

    /// On-disk footprint of `count` pending inodes: at least one record.
    fn inodes_len(&self, count: usize) -> u64 {
        let blocklen = self.blocklen() as u64;
        let iph = format::inodes_per_list(self.blocklen()) as u64;
        ceil_div(count as u64, iph).max(1) * blocklen
    }

    /// On-disk footprint of the whole accumulated transaction.
    fn transaction_len(&self, st: &State) -> u64 {
        let blocklen = self.blocklen() as u64;
        let bph = format::blocks_per_list(self.blocklen()) as u64;
        let mut len = st.bcount as u64;
        len += ceil_div(st.bufcount as u64, bph) * blocklen;
        len += ceil_div(st.deallocs.len() as u64, bph) * blocklen;
        len += self.inodes_len(st.inodes.len());
        len
    }

    /// Issue the device write barrier, if enabled. Failures are logged
    /// and otherwise ignored: some devices cannot flush their cache, and
    /// refusing to commit would wedge them entirely.
    fn sync_cache(&self) {
        if !self.flush_disk_cache {
            return;
        }
        if let Err(err) = self.dev.cache_flush() {
            warn!("log device cache flush failed: {err}");
        }
    }

    /// Write `data` into the ring at byte offset `*off`, wrapping at the
    /// region end, and advance the cursor.
    fn circ_write(
        &self,
        co: &mut Coalescer,
        data: &[u8],
        off: &mut u64,
    ) -> io::Result<()> {
        debug_assert_eq!(data.len() & (self.blocklen() - 1), 0);
        let mut data = data;
        let mut pos = *off;

        if pos < self.ring.off() {
            pos = self.ring.off();
        }
        let until_end = (self.ring.off() + self.ring.size() - pos) as usize;
        if until_end < data.len() {
            co.write(self.dev.as_ref(), &data[..until_end], self.pbn_of(pos))?;
            data = &data[until_end..];
            pos = self.ring.off();
        }
        co.write(self.dev.as_ref(), data, self.pbn_of(pos))?;
        pos += data.len() as u64;
        if pos >= self.ring.off() + self.ring.size() {
            pos = self.ring.off();
        }
        *off = pos;
        Ok(())
    }

    /// Write the commit header for (`head`, `tail`) to the slot selected
    /// by the current generation, making everything written before it
    /// durable first. When the generation is zero both slots are stale, so
    /// a second pass runs and leaves both valid.
    fn write_commit(&self, head: u64, tail: u64) -> JournalResult<()> {
        let mut co = self.writer.lock();
        loop {
            co.flush(self.dev.as_ref())?;
            // Everything the header will reference must be stable before
            // the header itself.
            self.sync_cache();

            let generation = self.state.lock().generation;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let header = CommitHeader {
                generation,
                head,
                tail,
                circ_off: self.ring.off(),
                circ_size: self.ring.size(),
                log_dev_bshift: self.log_dev_bshift,
                fs_dev_bshift: self.fs_dev_bshift,
                log_id: self.log_id,
                time_sec: now.as_secs(),
                time_nsec: now.subsec_nanos(),
            };
            let slot = self.log_start + (generation % 2);
            trace!(generation, head, tail, slot, "writing commit header");

            co.write(self.dev.as_ref(), &header.encode(self.blocklen()), slot)?;
            co.flush(self.dev.as_ref())?;
            // The header must be stable before dependent ring space is
            // reused.
            self.sync_cache();

            self.state.lock().generation = generation + 1;
            if generation != 0 {
                return Ok(());
            }
        }
    }

    /// Write BLOCKS records (headers + payloads) for the pinned buffers.
    fn write_blocks(
        &self,
        co: &mut Coalescer,
        bufs: &[(BufferId, BufMeta)],
        off: &mut u64,
    ) -> JournalResult<()> {
        let blocklen = self.blocklen();
        let bph = format::blocks_per_list(blocklen);

        for chunk in bufs.chunks(bph) {
            let pairs: Vec<(u64, u32)> =
                chunk.iter().map(|(_, m)| (m.blk, m.io as u32)).collect();
            let payload: u64 = chunk.iter().map(|(_, m)| m.io as u64).sum();
            let mut total = blocklen as u64 + payload;
            let padding = (blocklen as u64 - total % blocklen as u64) % blocklen as u64;
            total += padding;
            trace!(len = total, padding, off = *off, "writing block record");

            let header = format::encode_block_list(BLOCKS_MAGIC, total as u32, &pairs, blocklen);
            self.circ_write(co, &header, off)?;
            for (id, meta) in chunk {
                let data = self.cache.data(*id);
                debug_assert_eq!(data.len(), meta.io);
                self.circ_write(co, &data, off)?;
            }
            if padding > 0 {
                self.circ_write(co, &vec![0u8; padding as usize], off)?;
            }
        }
        Ok(())
    }

    /// Write REVOCATIONS records for the pending deallocations.
    fn write_revocations(
        &self,
        co: &mut Coalescer,
        deallocs: &[Deallocation],
        off: &mut u64,
    ) -> JournalResult<()> {
        if deallocs.is_empty() {
            return Ok(());
        }
        let blocklen = self.blocklen();
        let bph = format::blocks_per_list(blocklen);

        for chunk in deallocs.chunks(bph) {
            let pairs: Vec<(u64, u32)> =
                chunk.iter().map(|d| (d.block.0, d.len)).collect();
            trace!(count = pairs.len(), off = *off, "writing revocation record");
            let header =
                format::encode_block_list(REVOKE_MAGIC, blocklen as u32, &pairs, blocklen);
            self.circ_write(co, &header, off)?;
        }
        Ok(())
    }

    /// Write INODES records covering the complete pending set.
    ///
    /// Always writes at least one record: an empty `clear` record is what
    /// tells replay the set became empty.
    fn write_inodes(
        &self,
        co: &mut Coalescer,
        inodes: &[(u64, u32)],
        off: &mut u64,
    ) -> JournalResult<()> {
        let blocklen = self.blocklen();
        let iph = format::inodes_per_list(blocklen);

        let mut first = true;
        let mut rest = inodes;
        loop {
            let take = rest.len().min(iph);
            let (chunk, tail) = rest.split_at(take);
            trace!(count = chunk.len(), clear = first, off = *off, "writing inode record");
            let record = format::encode_inode_list(chunk, first, blocklen);
            self.circ_write(co, &record, off)?;
            rest = tail;
            first = false;
            if rest.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// The full flush sequence, entered with the transaction lock held
    /// exclusively.
    fn flush_locked(&self, wait: bool) -> JournalResult<()> {
        let deallocs = self.state.lock().deallocs.clone();
        self.hooks.flush_deallocations(&deallocs);

        // The hook may have been the whole point; re-check for work.
        if self.state.lock().bufcount > 0 {
            self.commit_transaction()?;
        }

        if wait {
            let reserved = self.state.lock().reserved;
            self.truncate(self.ring.size() - reserved, !self.eager_reclaim)?;
        }
        Ok(())
    }

    /// Steps 3–9 of the flush: size, reclaim, record writes, header,
    /// entry creation, buffer hand-off.
    fn commit_transaction(&self) -> JournalResult<()> {
        let (flushsize, reserved, bufs, deallocs, inodes) = {
            let st = self.state.lock();
            let mut inodes: Vec<(u64, u32)> =
                st.inodes.iter().map(|(&ino, &mode)| (ino, mode)).collect();
            inodes.sort_unstable();
            (
                self.transaction_len(&st),
                st.reserved,
                st.bufs.iter().map(|(&id, &m)| (id, m)).collect::<Vec<_>>(),
                st.deallocs.clone(),
                inodes,
            )
        };

        debug!(
            flushsize,
            buffers = bufs.len(),
            deallocs = deallocs.len(),
            inodes = inodes.len(),
            "flushing transaction"
        );

        if flushsize > self.ring.size() - reserved {
            return Err(JournalError::TransactionTooLarge {
                size: flushsize,
                capacity: self.ring.size() - reserved,
            });
        }

        self.truncate(flushsize, false)?;

        let (head0, tail0) = {
            let st = self.state.lock();
            (st.head, st.tail)
        };
        debug_assert!(self.ring.contains(head0));

        let mut off = head0;
        {
            let mut co = self.writer.lock();
            self.write_blocks(&mut co, &bufs, &mut off)?;
            self.write_revocations(&mut co, &deallocs, &mut off)?;
            self.write_inodes(&mut co, &inodes, &mut off)?;
        }

        let new_reserved = if inodes.is_empty() {
            0
        } else {
            self.inodes_len(inodes.len())
        };

        let mut head = head0;
        let mut tail = tail0;
        self.ring
            .advance_head(&mut head, &mut tail, flushsize)
            .map_err(|_| JournalError::InvalidGeometry("flush outran reclaimed space"))?;
        debug_assert_eq!(head, off);

        // Opportunistically drag the tail over bytes already reclaimed;
        // shrinks the next truncate wait without affecting correctness.
        let mut delta = 0;
        if self.eager_reclaim {
            delta = self.state.lock().reclaimable;
            self.ring
                .advance_tail(&mut head, &mut tail, delta)
                .map_err(|_| JournalError::InvalidGeometry("reclaim accounting out of sync"))?;
        }

        self.write_commit(head, tail)?;

        let (entry_id, buf_ids) = {
            let mut st = self.state.lock();
            st.head = head;
            st.tail = tail;
            st.reserved = new_reserved;
            debug_assert!(st.reclaimable >= delta);
            st.reclaimable -= delta;
            st.deallocs.clear();

            let entry_id = st.next_entry_id;
            st.next_entry_id += 1;
            let bufcount = st.bufcount;
            st.entries.push_back(Entry {
                id: entry_id,
                bufcount,
                reclaimable_bytes: flushsize,
                error: false,
            });

            let ids: Vec<BufferId> = st.bufs.keys().copied().collect();
            st.bufs.clear();
            st.bufbytes = 0;
            st.bufcount = 0;
            st.bcount = 0;
            (entry_id, ids)
        };

        trace!(entry_id, buffers = buf_ids.len(), "starting buffer writeback");
        for id in buf_ids {
            let weak = self.self_weak.clone();
            self.cache.start_write(
                id,
                Box::new(move |result| {
                    if let Some(inner) = weak.upgrade() {
                        inner.buffer_done(entry_id, result);
                    }
                }),
            );
        }
        Ok(())
    }

    /// Completion handler for one buffer write of one entry.
    fn buffer_done(&self, entry_id: u64, result: io::Result<()>) {
        let mut st = self.state.lock();
        let Some(pos) = st.entries.iter().position(|e| e.id == entry_id) else {
            // The entry was discarded while the write was in flight.
            return;
        };

        if let Err(err) = result {
            warn!(entry_id, "buffer writeback failed: {err}");
            if !st.entries[pos].error {
                st.entries[pos].error = true;
                st.error_count += 1;
                if st.error_count == 1 {
                    self.space_cv.notify_all();
                }
            }
        }

        debug_assert!(st.entries[pos].bufcount > 0);
        st.entries[pos].bufcount -= 1;

        // Reclaim the longest fully-synced prefix, preserving log order:
        // a later transaction's bytes never free up ahead of an earlier
        // one's.
        if st.entries[pos].bufcount == 0 {
            let mut delta = 0;
            while let Some(front) = st.entries.front() {
                if front.bufcount != 0 {
                    break;
                }
                delta += front.reclaimable_bytes;
                st.entries.pop_front();
            }
            if delta > 0 {
                st.reclaimable += delta;
                trace!(delta, "entry prefix synced; space reclaimable");
                self.space_cv.notify_all();
            }
        }
    }

    /// Block until at least `minfree` bytes are free, then advance the
    /// tail over the reclaimed span and commit the new tail. `waitonly`
    /// skips the tail movement (report-only mode).
    ///
    /// Called with the transaction lock held exclusively.
    fn truncate(&self, minfree: u64, waitonly: bool) -> JournalResult<()> {
        let mut st = self.state.lock();
        debug_assert!(minfree <= self.ring.size() - st.reserved);

        if st.error_count > 0 {
            return Err(JournalError::LogFailed);
        }

        let avail = self.ring.space_free(st.head, st.tail);
        if minfree < avail {
            return Ok(());
        }
        let needed = minfree - avail;

        while st.error_count == 0 && st.reclaimable < needed {
            trace!(
                reclaimable = st.reclaimable,
                needed,
                "waiting for entries to sync"
            );
            self.space_cv.wait(&mut st);
        }
        if st.reclaimable < needed {
            debug_assert!(st.error_count > 0);
            return Err(JournalError::LogFailed);
        }

        let mut head = st.head;
        let mut tail = st.tail;
        let mut delta = st.reclaimable;
        // With every entry synced, keep the pending-inode list footprint
        // on disk: the log must never truncate past its own record of
        // unlinked inodes.
        if st.entries.is_empty() && delta >= st.reserved {
            delta -= st.reserved;
        }
        self.ring
            .advance_tail(&mut head, &mut tail, delta)
            .map_err(|_| JournalError::InvalidGeometry("reclaim accounting out of sync"))?;
        drop(st);

        if waitonly {
            return Ok(());
        }

        // The new tail is only real once the header recording it is
        // durable; until then the space is not reused.
        self.write_commit(head, tail)?;

        let mut st = self.state.lock();
        st.head = head;
        st.tail = tail;
        debug_assert!(st.reclaimable >= delta);
        st.reclaimable -= delta;
        debug!(delta, "log truncated");
        Ok(())
    }

    /// Carry a recovered pending-inode list into this log: re-register the
    /// inodes, place head and tail at the recovered list position, rewrite
    /// the list there, and reserve its footprint.
    fn adopt_replay_inodes(&self, wr: &Replay) -> JournalResult<()> {
        if wr.circ_off() != self.ring.off()
            || wr.circ_size() != self.ring.size()
            || wr.log_dev_bshift() != self.log_dev_bshift
            || wr.fs_dev_bshift() != self.fs_dev_bshift
        {
            return Err(JournalError::ReplayMismatch(
                "recovered log geometry differs from this log",
            ));
        }

        let (inodes_head, inodes_tail) = wr.inode_window();
        let inodes: Vec<(u64, u32)> = {
            let mut st = self.state.lock();
            st.generation = wr.generation() + 1;
            for pi in wr.pending_inodes() {
                st.inodes.insert(pi.inode, pi.mode);
            }
            let footprint = self.transaction_len(&st);
            if footprint > self.ring.space_free(inodes_head, inodes_tail) {
                return Err(JournalError::ReplayMismatch(
                    "recovered pending-inode list does not fit ahead of itself",
                ));
            }
            st.head = inodes_head;
            st.tail = inodes_head;
            st.reserved = footprint;
            st.reclaimable = footprint;
            let mut list: Vec<(u64, u32)> =
                st.inodes.iter().map(|(&ino, &mode)| (ino, mode)).collect();
            list.sort_unstable();
            list
        };

        debug!(
            count = inodes.len(),
            at = inodes_head,
            "carrying recovered pending inodes into new log"
        );

        let mut off = inodes_head;
        {
            let mut co = self.writer.lock();
            self.write_inodes(&mut co, &inodes, &mut off)?;
        }

        let mut st = self.state.lock();
        st.head = off;
        debug_assert_ne!(st.head, st.tail);
        debug_assert_ne!(st.head, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingHooks, MemDevice, MockCache};
    use ringlog_core::NoopHooks;

    fn small_journal(cache: Arc<MockCache>) -> (Journal, Arc<MemDevice>) {
        // 64 KiB of 512-byte blocks, plus the two header blocks.
        let dev = Arc::new(MemDevice::new(512, 130));
        let journal = Journal::open(
            dev.clone(),
            cache,
            Arc::new(NoopHooks),
            LogLocation::new(0, 130, 512),
            JournalConfig::for_testing(),
            None,
        )
        .unwrap();
        (journal, dev)
    }

    #[test]
    fn test_open_writes_both_header_slots() {
        let (journal, dev) = small_journal(Arc::new(MockCache::immediate()));
        // Generation started at zero, so both slots must now decode.
        let mut slot = vec![0u8; 512];
        dev.read_at(0, &mut slot).unwrap();
        let first = CommitHeader::decode(&slot).unwrap();
        dev.read_at(1, &mut slot).unwrap();
        let second = CommitHeader::decode(&slot).unwrap();
        assert_eq!(first.generation, 0);
        assert_eq!(second.generation, 1);
        assert_eq!(journal.stats().generation, 2);
    }

    #[test]
    fn test_open_rejects_bad_geometry() {
        let dev = Arc::new(MemDevice::new(500, 130));
        let err = Journal::open(
            dev,
            Arc::new(MockCache::immediate()),
            Arc::new(NoopHooks),
            LogLocation::new(0, 130, 500),
            JournalConfig::for_testing(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, JournalError::InvalidGeometry(_)));

        let dev = Arc::new(MemDevice::new(512, 4));
        let err = Journal::open(
            dev,
            Arc::new(MockCache::immediate()),
            Arc::new(NoopHooks),
            LogLocation::new(0, 4, 512),
            JournalConfig::for_testing(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, JournalError::InvalidGeometry(_)));
    }

    #[test]
    fn test_begin_end_counts_transactions() {
        let (journal, _dev) = small_journal(Arc::new(MockCache::immediate()));
        let t1 = journal.begin().unwrap();
        let t2 = journal.begin().unwrap();
        assert_eq!(journal.inner.state.lock().open_txns, 2);
        t1.end();
        drop(t2);
        assert_eq!(journal.inner.state.lock().open_txns, 0);
    }

    #[test]
    fn test_add_buf_is_idempotent() {
        let cache = Arc::new(MockCache::immediate());
        let (journal, _dev) = small_journal(cache.clone());
        cache.insert(BufferId(1), 100, vec![0xAA; 1024]);

        let txn = journal.begin().unwrap();
        txn.add_buf(BufferId(1)).unwrap();
        txn.add_buf(BufferId(1)).unwrap();
        let stats = journal.stats();
        assert_eq!(stats.bufcount, 1);
        assert_eq!(stats.bcount, 1024);

        txn.remove_buf(BufferId(1));
        txn.remove_buf(BufferId(1));
        let stats = journal.stats();
        assert_eq!(stats.bufcount, 0);
        assert_eq!(stats.bcount, 0);
    }

    #[test]
    fn test_add_buf_rejects_misaligned() {
        let cache = Arc::new(MockCache::immediate());
        let (journal, _dev) = small_journal(cache.clone());
        cache.insert(BufferId(1), 100, vec![0xAA; 300]);

        let txn = journal.begin().unwrap();
        assert!(matches!(
            txn.add_buf(BufferId(1)),
            Err(JournalError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_dealloc_limit_is_recoverable() {
        let cache = Arc::new(MockCache::immediate());
        let (journal, _dev) = small_journal(cache.clone());

        let txn = journal.begin().unwrap();
        for i in 0..16u64 {
            txn.register_deallocation(BlockNo(i), 512).unwrap();
        }
        let err = txn.register_deallocation(BlockNo(99), 512).unwrap_err();
        assert!(matches!(
            err,
            JournalError::DeallocationLimitExceeded { limit: 16 }
        ));
        txn.end();

        // A flush drains the list and registration works again.
        cache.insert(BufferId(1), 5, vec![1; 512]);
        let txn = journal.begin().unwrap();
        txn.add_buf(BufferId(1)).unwrap();
        txn.end();
        journal.flush(false).unwrap();

        let txn = journal.begin().unwrap();
        txn.register_deallocation(BlockNo(99), 512).unwrap();
        txn.end();
    }

    #[test]
    fn test_inode_registry_set_semantics() {
        let (journal, _dev) = small_journal(Arc::new(MockCache::immediate()));
        let txn = journal.begin().unwrap();
        txn.register_inode(7, 0o100644);
        txn.register_inode(7, 0o100644);
        txn.register_inode(8, 0o100600);
        assert_eq!(journal.stats().inode_count, 2);
        txn.unregister_inode(7);
        txn.unregister_inode(7);
        assert_eq!(journal.stats().inode_count, 1);
        txn.end();
    }

    #[test]
    fn test_transaction_too_large_is_recoverable() {
        let cache = Arc::new(MockCache::immediate());
        let hooks = Arc::new(CountingHooks::new());
        let dev = Arc::new(MemDevice::new(512, 34)); // 16 KiB ring
        let journal = Journal::open(
            dev,
            cache.clone(),
            hooks.clone(),
            LogLocation::new(0, 34, 512),
            JournalConfig::for_testing().with_max_transfer(4096),
            None,
        )
        .unwrap();

        cache.insert(BufferId(1), 10, vec![0xEE; 20 * 1024]);
        let txn = journal.begin().unwrap();
        txn.add_buf(BufferId(1)).unwrap();
        txn.end();

        let err = journal.flush(false).unwrap_err();
        assert!(matches!(err, JournalError::TransactionTooLarge { .. }));
        assert_eq!(hooks.abort_calls(), 1);
        // Accumulator left intact for the caller to deal with.
        assert_eq!(journal.stats().bufcount, 1);

        journal.discard();
        assert_eq!(journal.stats().bufcount, 0);
        assert_eq!(cache.released(), vec![BufferId(1)]);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let (journal, dev) = small_journal(Arc::new(MockCache::immediate()));
        let writes_after_open = dev.write_count();
        journal.flush(false).unwrap();
        assert_eq!(dev.write_count(), writes_after_open);
    }

    #[test]
    fn test_sticky_error_fails_flush_until_discard() {
        let cache = Arc::new(MockCache::manual());
        let (journal, _dev) = small_journal(cache.clone());

        cache.insert(BufferId(1), 10, vec![1; 512]);
        let txn = journal.begin().unwrap();
        txn.add_buf(BufferId(1)).unwrap();
        txn.end();
        journal.flush(false).unwrap();

        // The writeback fails: the journal goes into the sticky state.
        cache.complete_at(0, Err(io::Error::new(io::ErrorKind::Other, "bad disk")));
        assert_eq!(journal.stats().error_count, 1);

        cache.insert(BufferId(2), 11, vec![2; 512]);
        let txn = journal.begin().unwrap();
        txn.add_buf(BufferId(2)).unwrap();
        txn.end();
        assert!(matches!(
            journal.flush(false),
            Err(JournalError::LogFailed)
        ));

        journal.discard();
        assert_eq!(journal.stats().error_count, 0);
    }

    #[test]
    fn test_close_reports_pending_inodes() {
        let (journal, _dev) = small_journal(Arc::new(MockCache::immediate()));
        let txn = journal.begin().unwrap();
        txn.register_inode(42, 0o100644);
        txn.end();

        let err = journal.clone().close(false).unwrap_err();
        assert!(matches!(err, JournalError::PendingInodes { count: 1 }));
        journal.close(true).unwrap();
    }
}
