//! Synchronization primitives
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        WaitMutex<T>                        │
//! │   try_lock ─▶ spin ─▶ reserve cell ─▶ re-check ─▶ wait      │
//! └──────────────────────────────┬─────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼─────────────────────────────┐
//! │                         WaitArray                          │
//! │  cells: Free ─▶ Reserved ─▶ WakingUp ─▶ Free               │
//! │  holders: object ─▶ thread      (deadlock walk)            │
//! │  sweep(): long-wait warnings / fatal                       │
//! └──────────────┬──────────────────────────────┬──────────────┘
//!                │                              │
//!        ┌───────▼───────┐              ┌───────▼───────┐
//!        │ Event per cell│              │   Watchdog    │
//!        │ (signal count)│              │ (sweep thread)│
//!        └───────────────┘              └───────────────┘
//! ```
//!
//! # Lock Hierarchy
//!
//! Locks in the pool are taken outermost first:
//!
//! 1. **LRU state** (`WaitMutex<LruState>`) - LRU list, free list, slot lifecycle
//! 2. **Per-page lock** (`Mutex<Option<ZipRef>>`) - compressed image descriptor
//! 3. **Buddy state** (`WaitMutex<BuddyState>`) - buddy free lists and stamps
//! 4. **Frame latch** (`RwLock<Box<[u8]>>`) - page contents
//! 5. **Wait array** internals - always innermost
//!
//! Directory shards are leaves: held for a single lookup or update and never
//! while acquiring anything else. The buddy allocator never takes the LRU
//! state while holding its own lock, and takes per-page locks only with
//! `try_lock`.

pub mod event;
pub mod mutex;
pub mod wait_array;
pub mod watchdog;

pub use event::Event;
pub use mutex::{WaitMutex, WaitMutexGuard};
pub use wait_array::{
    CellId, CellInfo, CellState, ObjectId, SweepReport, ThreadKey, WaitArray, WaitKind, WaitStats,
};
pub use watchdog::Watchdog;
