//! Buffer pool
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             BufferPool                               │
//! │                                                                      │
//! │  get_page / create_page ──▶ PageDirectory ──hit──▶ pin + make young  │
//! │          │ miss                                                      │
//! │          ▼                                                           │
//! │  ReadAhead (random) ──▶ acquire_free_slot ──▶ PageStore::read_page   │
//! │                              │                                       │
//! │            free list ◀───────┼──────▶ LRU tail scan ──▶ Flusher      │
//! │                              │                                       │
//! │  ┌───────────────────┐   ┌───┴───────────────┐   ┌────────────────┐  │
//! │  │ LruState          │   │ BuddyState        │   │ AsyncIo        │  │
//! │  │ young │ old       │   │ free lists/stamps │   │ read-ahead I/O │  │
//! │  └───────────────────┘   └───────────────────┘   └────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Blocks** (`block.rs`): slot arena entries with frame, pin count,
//!   io-fix and access bookkeeping
//! - **LRU** (`lru.rs`): young/old list and the state guarded with it
//! - **Pool** (`pool.rs`): slot acquisition, eviction, page access,
//!   tablespace eviction, write-back and validation
//! - **Read-ahead** (`read_ahead.rs`): random and linear triggers
//! - **Buddy** (`buddy.rs`): sub-page blocks for compressed images
//! - **Compression** (`zip.rs`): LZ4 page images
//! - **Flusher** (`flush.rs`): write-back hook
//! - **Metrics** (`metrics.rs`): prometheus counters

pub mod block;
pub mod buddy;
pub mod flush;
pub mod lru;
pub mod metrics;
pub mod pool;
pub mod read_ahead;
pub mod zip;

#[cfg(test)]
mod proptest;

pub use block::{BufBlock, IoFix, SlotId, SlotMeta, SlotState, ZipRef};
pub use buddy::{BlockAddr, Buddy, BuddySizes, BuddyState, BuddyStats, SlotSource, Stamp};
pub use flush::{Flusher, LruTailFlusher, NoopFlusher};
pub use lru::{LruList, LruState};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pool::{
    BufferPool, MemoryBlock, PageReadGuard, PageWriteGuard, PinnedPage, PoolBuilder, PoolStats,
    RecoveryPhase,
};
pub use read_ahead::{area_bounds, ReadAhead};
pub use zip::PageCompressor;
