//! bufpool - in-memory page cache for a disk-backed storage engine
//!
//! A fixed-capacity pool of page slots with a young/old LRU that resists
//! pollution by one-off scans, random and linear read-ahead, a binary buddy
//! allocator for compressed page images, and a wait array that provides
//! blocking locks with deadlock detection and long-wait monitoring.
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────────────────────────────────────────┐
//!  callers ──▶│ BufferPool: get_page / create_page / evict   │
//!             │   LRU (young│old) · buddy · read-ahead       │
//!             └──────┬───────────────┬──────────────┬────────┘
//!                    │               │              │
//!            PageDirectory      AsyncIo /       WaitArray
//!            (sharded map)      PageStore       (WaitMutex, Watchdog)
//! ```
//!
//! # Modules
//!
//! - [`buf`] - the pool: slots, LRU, read-ahead, buddy allocator
//! - [`storage`] - page directory, page store and asynchronous I/O
//! - [`sync`] - wait array, events, wait mutex and watchdog
//! - [`page`] - page ids and the on-page header
//! - [`config`] - configuration with serde loading
//! - [`error`] - error types and the fatal policy
//! - [`telemetry`] - tracing subscriber setup
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bufpool::{BufferPool, MemStore, PageId, PoolConfig, SpaceId};
//!
//! let config = PoolConfig::default();
//! let store = Arc::new(MemStore::new(config.page_size));
//! store.create_space(SpaceId(1), 1024);
//!
//! let pool = BufferPool::new(config, store)?;
//! let page = pool.get_page(PageId::new(1, 7))?;
//! let lsn = bufpool::page::lsn(&page.read());
//! ```

pub mod buf;
pub mod config;
pub mod error;
pub mod page;
pub mod storage;
pub mod sync;
pub mod telemetry;

// Re-export commonly used types
pub use buf::{BufferPool, PinnedPage, PoolBuilder, PoolStats, RecoveryPhase};
pub use config::PoolConfig;
pub use error::{Error, FatalPolicy, Result, Severity};
pub use page::{PageId, SpaceId};
pub use storage::{InlineIo, MemStore, PageDirectory, PageStore, ShardedDirectory, ThreadedIo};
pub use sync::{WaitArray, WaitMutex, Watchdog};
