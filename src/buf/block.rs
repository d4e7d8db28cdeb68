//! Page slots
//!
//! A [`BufBlock`] is one entry of the pool's slot arena. Fields read on hot
//! paths without the LRU state lock are atomics; lifecycle state and the
//! page id live in [`SlotMeta`] under the LRU state lock.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::page::PageId;

/// Index of a slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(pub u32);

impl SlotId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// On the free list
    NotUsed,
    /// Taken off the free list, not yet initialised
    ReadyForUse,
    /// Caches a file page; in the directory and on the LRU list
    FilePage,
    /// Lent out as raw memory (buddy host or memory block)
    Memory,
    /// Being removed from the directory
    RemoveHash,
}

/// In-flight I/O on a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IoFix {
    None = 0,
    Read = 1,
    Write = 2,
}

impl IoFix {
    fn from_u8(v: u8) -> IoFix {
        match v {
            1 => IoFix::Read,
            2 => IoFix::Write,
            _ => IoFix::None,
        }
    }
}

/// Where a compressed page image lives inside a buddy host slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZipRef {
    /// Host slot
    pub slot: SlotId,
    /// Byte offset inside the host frame
    pub offset: u32,
    /// Buddy size class of the block
    pub class: u8,
    /// Bytes of the image actually used
    pub len: u32,
}

/// Slot metadata protected by the LRU state lock
#[derive(Debug, Clone, Copy)]
pub struct SlotMeta {
    pub state: SlotState,
    pub page: Option<PageId>,
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self {
            state: SlotState::NotUsed,
            page: None,
        }
    }
}

/// One page slot
pub struct BufBlock {
    id: SlotId,
    /// Page contents (the frame latch)
    pub(crate) frame: RwLock<Box<[u8]>>,
    pin_count: AtomicU32,
    io_fix: AtomicU8,
    /// Modification stamp of the oldest unflushed change (0 = clean)
    dirty_since: AtomicU64,
    /// Modification stamp of the newest change
    last_modified: AtomicU64,
    accessed: AtomicBool,
    /// Pool-wide order of first accesses
    access_seq: AtomicU64,
    /// Milliseconds since pool start of the first access
    first_access_ms: AtomicU64,
    /// Per-page lock guarding the compressed image descriptor
    pub(crate) zip: Mutex<Option<ZipRef>>,
}

impl BufBlock {
    pub fn new(id: SlotId, page_size: usize) -> Self {
        Self {
            id,
            frame: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            io_fix: AtomicU8::new(IoFix::None as u8),
            dirty_since: AtomicU64::new(0),
            last_modified: AtomicU64::new(0),
            accessed: AtomicBool::new(false),
            access_seq: AtomicU64::new(0),
            first_access_ms: AtomicU64::new(0),
            zip: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin of unpinned {}", self.id);
    }

    pub fn io_fix(&self) -> IoFix {
        IoFix::from_u8(self.io_fix.load(Ordering::SeqCst))
    }

    pub(crate) fn set_io_fix(&self, fix: IoFix) {
        self.io_fix.store(fix as u8, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.load(Ordering::SeqCst) != 0
    }

    /// Stamp of the oldest unflushed modification, if dirty
    pub fn dirty_since(&self) -> Option<u64> {
        match self.dirty_since.load(Ordering::SeqCst) {
            0 => None,
            s => Some(s),
        }
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::SeqCst)
    }

    /// Record a modification with stamp `stamp` (non-zero, increasing)
    pub(crate) fn mark_dirty(&self, stamp: u64) {
        self.last_modified.store(stamp, Ordering::SeqCst);
        let _ = self
            .dirty_since
            .compare_exchange(0, stamp, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Clear the dirty marker if nothing changed after `seen`
    pub(crate) fn mark_clean_if_unchanged(&self, seen: u64) -> bool {
        if self.last_modified() == seen {
            self.dirty_since.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn is_accessed(&self) -> bool {
        self.accessed.load(Ordering::SeqCst)
    }

    /// Set the accessed flag; returns `true` on the first access
    pub(crate) fn mark_accessed(&self, seq: u64, now_ms: u64) -> bool {
        if self.accessed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.access_seq.store(seq, Ordering::SeqCst);
        self.first_access_ms.store(now_ms, Ordering::SeqCst);
        true
    }

    pub fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::SeqCst)
    }

    pub fn first_access_ms(&self) -> u64 {
        self.first_access_ms.load(Ordering::SeqCst)
    }

    /// Unpinned, clean and without in-flight I/O
    pub fn is_replaceable(&self) -> bool {
        !self.is_pinned() && !self.is_dirty() && self.io_fix() == IoFix::None
    }

    /// Descriptor of the attached compressed image
    pub fn zip_ref(&self) -> Option<ZipRef> {
        *self.zip.lock()
    }

    /// Reset everything but the frame contents before reuse
    pub(crate) fn reset(&self) {
        self.pin_count.store(0, Ordering::SeqCst);
        self.set_io_fix(IoFix::None);
        self.dirty_since.store(0, Ordering::SeqCst);
        self.last_modified.store(0, Ordering::SeqCst);
        self.accessed.store(false, Ordering::SeqCst);
        self.access_seq.store(0, Ordering::SeqCst);
        self.first_access_ms.store(0, Ordering::SeqCst);
    }
}

impl fmt::Debug for BufBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufBlock")
            .field("id", &self.id)
            .field("pin_count", &self.pin_count())
            .field("io_fix", &self.io_fix())
            .field("dirty_since", &self.dirty_since())
            .field("accessed", &self.is_accessed())
            .finish()
    }
}
