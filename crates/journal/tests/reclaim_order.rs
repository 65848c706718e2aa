//! Reclamation must follow commit (log) order, not completion order.
//!
//! Three transactions A, B, C are flushed in that order and their buffer
//! writebacks complete as C, A, B. Ring bytes may only become reclaimable
//! in creation order: nothing until A finishes, then A alone, then B and C
//! together once B (the new FIFO head) finishes.

use ringlog_core::{BufferId, NoopHooks};
use ringlog_journal::testing::{MemDevice, MockCache};
use ringlog_journal::{Journal, JournalConfig, LogLocation};
use std::sync::Arc;

/// Each transaction: one 512-byte buffer, so each occupies
/// 512 (payload) + 512 (BLOCKS header) + 512 (INODES record) = 1536 bytes.
const ENTRY_BYTES: u64 = 1536;

fn flush_one(journal: &Journal, cache: &MockCache, id: u64) {
    cache.insert(BufferId(id), 300 + id, vec![id as u8; 512]);
    let txn = journal.begin().unwrap();
    txn.add_buf(BufferId(id)).unwrap();
    txn.end();
    journal.flush(false).unwrap();
}

#[test]
fn test_out_of_order_completion_reclaims_in_fifo_order() {
    let dev = Arc::new(MemDevice::new(512, 130));
    let cache = Arc::new(MockCache::manual());
    let journal = Journal::open(
        dev,
        cache.clone(),
        Arc::new(NoopHooks),
        LogLocation::new(0, 130, 512),
        JournalConfig::for_testing(),
        None,
    )
    .unwrap();

    flush_one(&journal, &cache, 1); // A
    flush_one(&journal, &cache, 2); // B
    flush_one(&journal, &cache, 3); // C

    assert_eq!(journal.stats().entries, 3);
    assert_eq!(journal.stats().reclaimable_bytes, 0);
    assert_eq!(
        cache.pending_ids(),
        vec![BufferId(1), BufferId(2), BufferId(3)]
    );

    // C completes first: it is not the FIFO head, so nothing reclaims.
    cache.complete_at(2, Ok(()));
    let stats = journal.stats();
    assert_eq!(stats.reclaimable_bytes, 0);
    assert_eq!(stats.entries, 3);

    // A completes: only A's bytes reclaim, C stays blocked behind B.
    cache.complete_at(0, Ok(()));
    let stats = journal.stats();
    assert_eq!(stats.reclaimable_bytes, ENTRY_BYTES);
    assert_eq!(stats.entries, 2);

    // B completes: B and the already-finished C reclaim together.
    cache.complete_at(0, Ok(()));
    let stats = journal.stats();
    assert_eq!(stats.reclaimable_bytes, 3 * ENTRY_BYTES);
    assert_eq!(stats.entries, 0);

    // The drain flush can now pull the tail all the way forward.
    journal.flush(true).unwrap();
    let stats = journal.stats();
    assert_eq!((stats.head, stats.tail), (0, 0));
    assert_eq!(stats.reclaimable_bytes, 0);
}

#[test]
fn test_failed_entry_still_counts_down_but_poisons_log() {
    let dev = Arc::new(MemDevice::new(512, 130));
    let cache = Arc::new(MockCache::manual());
    let journal = Journal::open(
        dev,
        cache.clone(),
        Arc::new(NoopHooks),
        LogLocation::new(0, 130, 512),
        JournalConfig::for_testing(),
        None,
    )
    .unwrap();

    flush_one(&journal, &cache, 1);
    flush_one(&journal, &cache, 2);

    // The first transaction's writeback fails; the second succeeds.
    cache.complete_at(
        0,
        Err(std::io::Error::new(std::io::ErrorKind::Other, "dead sector")),
    );
    cache.complete_at(0, Ok(()));

    let stats = journal.stats();
    // Counting down still drained the FIFO in order...
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.reclaimable_bytes, 2 * ENTRY_BYTES);
    // ...but the journal is poisoned until discarded.
    assert_eq!(stats.error_count, 1);
    assert!(journal.flush(true).is_err());

    journal.discard();
    assert_eq!(journal.stats().error_count, 0);
}
