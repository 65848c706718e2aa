//! Testing utilities for the journal engine.
//!
//! - [`MemDevice`]: an in-memory block device with write counting, fault
//!   injection, and crash simulation (writes past a chosen point are
//!   silently dropped, modeling power loss with an intact prefix).
//! - [`MockCache`]: a scriptable buffer cache whose async completions fire
//!   either inline or under test control, in any order.
//! - [`CountingHooks`]: flush hooks that record their invocations.

use parking_lot::Mutex;
use ringlog_core::{BlockDevice, BufferCache, BufferId, Deallocation, FlushHooks, WriteCompletion};
use std::collections::HashMap;
use std::io;

/// In-memory block device.
pub struct MemDevice {
    block_size: usize,
    state: Mutex<MemState>,
}

struct MemState {
    data: Vec<u8>,
    writes: u64,
    flushes: u64,
    crash_after: Option<u64>,
    fail_writes: bool,
}

impl MemDevice {
    /// A zero-filled device of `block_count` blocks of `block_size` bytes.
    pub fn new(block_size: usize, block_count: u64) -> Self {
        MemDevice {
            block_size,
            state: Mutex::new(MemState {
                data: vec![0u8; block_size * block_count as usize],
                writes: 0,
                flushes: 0,
                crash_after: None,
                fail_writes: false,
            }),
        }
    }

    /// A device initialized from a snapshot taken with [`contents`].
    ///
    /// [`contents`]: MemDevice::contents
    pub fn from_bytes(block_size: usize, bytes: Vec<u8>) -> Self {
        MemDevice {
            block_size,
            state: Mutex::new(MemState {
                data: bytes,
                writes: 0,
                flushes: 0,
                crash_after: None,
                fail_writes: false,
            }),
        }
    }

    /// Snapshot of the full device contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Number of `write_at` calls so far (applied or dropped).
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of `cache_flush` calls so far.
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    /// Simulate power loss: the next `n` writes are applied, everything
    /// after is silently dropped (the writer still sees success).
    pub fn crash_after_writes(&self, n: u64) {
        let mut state = self.state.lock();
        state.crash_after = Some(state.writes + n);
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_at(&self, pbn: u64, buf: &mut [u8]) -> io::Result<()> {
        let state = self.state.lock();
        let start = pbn as usize * self.block_size;
        let end = start + buf.len();
        if end > state.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at block {} past device end", buf.len(), pbn),
            ));
        }
        buf.copy_from_slice(&state.data[start..end]);
        Ok(())
    }

    fn write_at(&self, pbn: u64, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let seq = state.writes;
        state.writes += 1;
        if let Some(limit) = state.crash_after {
            if seq >= limit {
                // Crashed: the write never reaches the medium, but the
                // writer does not learn that.
                return Ok(());
            }
        }
        let start = pbn as usize * self.block_size;
        let end = start + data.len();
        if end > state.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("write of {} bytes at block {} past device end", data.len(), pbn),
            ));
        }
        state.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn cache_flush(&self) -> io::Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}

struct MockBuf {
    blk: u64,
    data: Vec<u8>,
}

struct CacheState {
    bufs: HashMap<BufferId, MockBuf>,
    pending: Vec<(BufferId, WriteCompletion)>,
    released: Vec<BufferId>,
    applied: Vec<BufferId>,
}

/// Scriptable buffer cache.
///
/// In immediate mode every `start_write` completes successfully inline;
/// in manual mode completions queue up and the test fires them in any
/// order with [`complete_at`] / [`complete_all`].
///
/// [`complete_at`]: MockCache::complete_at
/// [`complete_all`]: MockCache::complete_all
pub struct MockCache {
    immediate: bool,
    state: Mutex<CacheState>,
}

impl MockCache {
    /// A cache that completes writes inline.
    pub fn immediate() -> Self {
        Self::with_mode(true)
    }

    /// A cache whose completions are fired manually by the test.
    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(immediate: bool) -> Self {
        MockCache {
            immediate,
            state: Mutex::new(CacheState {
                bufs: HashMap::new(),
                pending: Vec::new(),
                released: Vec::new(),
                applied: Vec::new(),
            }),
        }
    }

    /// Register a dirty buffer destined for filesystem block `blk`.
    pub fn insert(&self, id: BufferId, blk: u64, data: Vec<u8>) {
        self.state.lock().bufs.insert(id, MockBuf { blk, data });
    }

    /// Number of writes waiting for a manual completion.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Buffer ids with writes waiting, in submission order.
    pub fn pending_ids(&self) -> Vec<BufferId> {
        self.state.lock().pending.iter().map(|(id, _)| *id).collect()
    }

    /// Fire the pending completion at `index` (submission order) with the
    /// given outcome.
    pub fn complete_at(&self, index: usize, result: io::Result<()>) {
        let (_, done) = {
            let mut state = self.state.lock();
            let entry = state.pending.remove(index);
            if result.is_ok() {
                state.applied.push(entry.0);
            }
            entry
        };
        done(result);
    }

    /// Fire every pending completion successfully, in submission order.
    pub fn complete_all(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    None
                } else {
                    let entry = state.pending.remove(0);
                    state.applied.push(entry.0);
                    Some(entry)
                }
            };
            match next {
                Some((_, done)) => done(Ok(())),
                None => break,
            }
        }
    }

    /// Ids released without being written (discard path).
    pub fn released(&self) -> Vec<BufferId> {
        self.state.lock().released.clone()
    }

    /// Ids whose writes completed successfully.
    pub fn applied(&self) -> Vec<BufferId> {
        self.state.lock().applied.clone()
    }
}

impl BufferCache for MockCache {
    fn disk_block(&self, buf: BufferId) -> u64 {
        self.state.lock().bufs[&buf].blk
    }

    fn mem_size(&self, buf: BufferId) -> usize {
        self.state.lock().bufs[&buf].data.len()
    }

    fn io_size(&self, buf: BufferId) -> usize {
        self.state.lock().bufs[&buf].data.len()
    }

    fn data(&self, buf: BufferId) -> Vec<u8> {
        self.state.lock().bufs[&buf].data.clone()
    }

    fn start_write(&self, buf: BufferId, done: WriteCompletion) {
        if self.immediate {
            self.state.lock().applied.push(buf);
            done(Ok(()));
        } else {
            self.state.lock().pending.push((buf, done));
        }
    }

    fn release(&self, buf: BufferId) {
        self.state.lock().released.push(buf);
    }
}

/// Flush hooks that count their invocations.
#[derive(Default)]
pub struct CountingHooks {
    calls: Mutex<HookCalls>,
}

#[derive(Default, Clone)]
struct HookCalls {
    flushes: usize,
    aborts: usize,
    last_deallocs: Vec<Deallocation>,
}

impl CountingHooks {
    /// A fresh hook recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `flush_deallocations` invocations.
    pub fn flush_calls(&self) -> usize {
        self.calls.lock().flushes
    }

    /// Number of `flush_aborted` invocations.
    pub fn abort_calls(&self) -> usize {
        self.calls.lock().aborts
    }

    /// Deallocation list passed to the most recent hook call.
    pub fn last_deallocs(&self) -> Vec<Deallocation> {
        self.calls.lock().last_deallocs.clone()
    }
}

impl FlushHooks for CountingHooks {
    fn flush_deallocations(&self, deallocs: &[Deallocation]) {
        let mut calls = self.calls.lock();
        calls.flushes += 1;
        calls.last_deallocs = deallocs.to_vec();
    }

    fn flush_aborted(&self, deallocs: &[Deallocation]) {
        let mut calls = self.calls.lock();
        calls.aborts += 1;
        calls.last_deallocs = deallocs.to_vec();
    }
}
