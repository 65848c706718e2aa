//! Core types and traits for Ringlog
//!
//! This crate defines the foundational pieces shared by the journal engine
//! and its embedders:
//! - BlockNo / BufferId / Deallocation / PendingInode: plain value types
//! - BlockDevice: synchronous block I/O with a cache-flush barrier
//! - BufferCache: the external owner of dirty buffers the journal pins
//! - FlushHooks: filesystem callbacks synchronized with commit/abort
//! - FileDevice: a `std::fs::File`-backed BlockDevice

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod types;

pub use device::{
    BlockDevice, BufferCache, FileDevice, FlushHooks, NoopHooks, WriteCompletion,
};
pub use types::{BlockNo, BufferId, Deallocation, PendingInode};
