//! Ringlog - write-ahead physical-block journaling
//!
//! Ringlog batches a filesystem's metadata writes into atomic,
//! crash-recoverable transactions backed by a fixed-size circular region of
//! a block device. It is filesystem-agnostic: the embedding filesystem
//! supplies a block device, a buffer cache, and flush hooks, and drives the
//! engine through `begin`/`add_buf`/`flush`.
//!
//! # Quick Start
//!
//! ```ignore
//! use ringlog::{Journal, JournalConfig, LogLocation};
//!
//! let location = LogLocation::new(0, 128, 512);
//! let journal = Journal::open(device, cache, hooks, location,
//!     JournalConfig::default(), None)?;
//!
//! let txn = journal.begin()?;
//! txn.add_buf(buf)?;
//! drop(txn);
//!
//! journal.flush(true)?;
//! ```
//!
//! # Architecture
//!
//! The engine lives in `ringlog-journal`; the collaborator traits
//! ([`BlockDevice`], [`BufferCache`], [`FlushHooks`]) and plain types live
//! in `ringlog-core`. After a crash, [`Replay`] reconstructs the latest
//! committed image of every logged block before the journal is reopened.

// Re-export the public API from the member crates
pub use ringlog_core::*;
pub use ringlog_journal::*;
