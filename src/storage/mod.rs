//! Storage-side interfaces of the buffer pool
//!
//! - [`directory`] - page id to slot lookup ([`PageDirectory`], [`ShardedDirectory`])
//! - [`store`] - durable pages ([`PageStore`], [`MemStore`])
//! - [`aio`] - asynchronous reads ([`AsyncIo`], [`ThreadedIo`], [`InlineIo`])

pub mod aio;
pub mod directory;
pub mod store;

pub use aio::{AsyncIo, InlineIo, PendingRead, ReadCompletion, ReadRequest, ThreadedIo};
pub use directory::{DirectoryStats, PageDirectory, ShardedDirectory};
pub use store::{MemStore, PageStore};
