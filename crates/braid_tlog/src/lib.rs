//! Durable, tag-indexed transaction log.
//!
//! A `TLogServer` accepts ordered commit pushes from the commit proxies,
//! indexes every mutation by its destination tags, spills cold data into a
//! persistent key-value store, and serves version-ordered peeks to storage
//! servers until they pop what they have made durable.

pub mod disk_queue;
pub mod kvstore;
pub mod log_data;
pub mod peek;
pub mod persist;
pub mod queue;
pub mod server;
mod spill;

pub use disk_queue::{DiskQueue, FileDiskQueue, MemDiskQueue};
pub use kvstore::FjallKvStore;
pub use persist::SpillType;
pub use queue::{TLogQueue, TLogQueueEntry};
pub use server::{LogConfig, TLogServer};
