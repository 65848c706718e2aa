//! Journal engine for Ringlog
//!
//! This crate is the write-ahead physical-block journal itself:
//!
//! - `ring`: circular allocator arithmetic (head/tail, used/free space)
//! - `format`: on-disk commit header and record codecs
//! - `journal`: transaction accumulation, flush/commit, reclamation
//! - `replay`: mount-time crash recovery
//! - `config`: explicit engine tunables
//! - `testing`: crash-injecting device and scriptable cache for tests
//!
//! The commit protocol in one paragraph: records are written into the free
//! span of the ring, a device cache flush makes them durable, then a
//! commit header naming the new head is written to one of two alternating
//! slots and flushed itself. A crash at any byte leaves either the old or
//! the new header intact, so replay always sees a whole number of
//! transactions. Ring space is handed back strictly in commit order as the
//! buffers of each transaction finish their writeback to their home
//! locations.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod coalesce;

pub mod config;
pub mod error;
pub mod format;
pub mod journal;
pub mod replay;
pub mod ring;
pub mod testing;

pub use config::{JournalConfig, LogLocation};
pub use error::{ConfigError, JournalError, JournalResult, ReplayError, ReplayResult};
pub use journal::{Journal, JournalStats, Transaction};
pub use replay::Replay;
pub use ring::{Ring, RingError};
