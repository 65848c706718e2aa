//! The whole commit/recover cycle against a real file-backed device.
//!
//! Everything else in the suite runs on the in-memory device; this file
//! checks that nothing depends on it: the journal and replay engines see
//! the same bytes through `FileDevice` and its `sync_data` barrier.

use ringlog_core::{BufferId, FileDevice, NoopHooks};
use ringlog_journal::testing::MockCache;
use ringlog_journal::{Journal, JournalConfig, LogLocation, Replay};
use std::sync::Arc;
use tempfile::NamedTempFile;

const BLOCK: usize = 512;
const LOCATION: LogLocation = LogLocation {
    start_block: 0,
    block_count: 130,
    block_size: BLOCK,
};

fn file_device() -> (NamedTempFile, Arc<FileDevice>) {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().set_len(LOCATION.byte_len()).unwrap();
    let dev = Arc::new(FileDevice::open(tmp.path(), BLOCK).unwrap());
    (tmp, dev)
}

#[test]
fn test_commit_and_replay_on_a_file() {
    let (tmp, dev) = file_device();
    let cache = Arc::new(MockCache::manual());
    let journal = Journal::open(
        dev.clone(),
        cache.clone(),
        Arc::new(NoopHooks),
        LOCATION,
        JournalConfig::for_testing(),
        None,
    )
    .unwrap();

    cache.insert(BufferId(1), 17, vec![0x5A; 2048]);
    let txn = journal.begin().unwrap();
    txn.add_buf(BufferId(1)).unwrap();
    txn.register_inode(123, 0o100644);
    txn.end();
    journal.flush(false).unwrap();
    drop(journal);

    // A different handle to the same file sees the committed state.
    let dev2 = Arc::new(FileDevice::open(tmp.path(), BLOCK).unwrap());
    let replay = Replay::start(dev2, LOCATION).unwrap();
    assert_eq!(replay.overlaid_blocks(), vec![17, 18, 19, 20]);
    assert_eq!(replay.pending_inodes().len(), 1);
    assert_eq!(replay.pending_inodes()[0].inode, 123);

    let mut unit = vec![0u8; 512];
    replay.read(&mut unit, ringlog_core::BlockNo(19)).unwrap();
    assert!(unit.iter().all(|&b| b == 0x5A));
}
