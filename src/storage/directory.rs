//! Page Directory
//!
//! Maps page ids to the slots caching them. The pool mutates the directory
//! only while holding its LRU state lock; lookups from read-ahead and
//! buddy relocation go straight to a shard.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Shards are `CachePadded` so neighbouring shard locks never share a line

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buf::SlotId;
use crate::page::PageId;

/// Lookup structure from page id to slot
pub trait PageDirectory: Send + Sync {
    /// Slot caching `page`, if any
    fn lookup(&self, page: PageId) -> Option<SlotId>;

    /// Map `page` to `slot`, returning the previous mapping
    fn insert(&self, page: PageId, slot: SlotId) -> Option<SlotId>;

    /// Remove the mapping of `page`
    fn remove(&self, page: PageId) -> Option<SlotId>;

    /// Number of mapped pages
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Shard
// =============================================================================

/// Single shard containing a hashmap and statistics
pub struct Shard {
    /// The hashmap for this shard
    map: RwLock<HashMap<PageId, SlotId>>,
    /// Number of entries
    count: AtomicU64,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}

impl Shard {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn get(&self, page: &PageId) -> Option<SlotId> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(page).copied()
    }

    fn insert(&self, page: PageId, slot: SlotId) -> Option<SlotId> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let old = self.map.write().insert(page, slot);
        if old.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    fn remove(&self, page: &PageId) -> Option<SlotId> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let removed = self.map.write().remove(page);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn entries(&self) -> Vec<(PageId, SlotId)> {
        self.map.read().iter().map(|(p, s)| (*p, *s)).collect()
    }
}

// =============================================================================
// Sharded Directory
// =============================================================================

/// Hash directory split into independently locked shards
pub struct ShardedDirectory {
    shards: Box<[CachePadded<Shard>]>,
    mask: usize,
}

impl ShardedDirectory {
    /// Create a directory with `shards` shards, rounded up to a power of two
    pub fn new(shards: usize) -> Self {
        let n = shards.max(1).next_power_of_two();
        let shards: Vec<CachePadded<Shard>> =
            (0..n).map(|_| CachePadded::new(Shard::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: n - 1,
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_index(&self, page: &PageId) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        page.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    /// Every mapping, in no particular order
    pub fn entries(&self) -> Vec<(PageId, SlotId)> {
        self.shards.iter().flat_map(|s| s.entries()).collect()
    }

    pub fn stats(&self) -> DirectoryStats {
        let shard_entry_counts: Vec<usize> = self.shards.iter().map(|s| s.len()).collect();
        DirectoryStats {
            total_entries: shard_entry_counts.iter().sum(),
            total_reads: self.shards.iter().map(|s| s.read_count()).sum(),
            total_writes: self.shards.iter().map(|s| s.write_count()).sum(),
            shard_entry_counts,
        }
    }
}

impl PageDirectory for ShardedDirectory {
    fn lookup(&self, page: PageId) -> Option<SlotId> {
        self.shards[self.shard_index(&page)].get(&page)
    }

    fn insert(&self, page: PageId, slot: SlotId) -> Option<SlotId> {
        self.shards[self.shard_index(&page)].insert(page, slot)
    }

    fn remove(&self, page: PageId) -> Option<SlotId> {
        self.shards[self.shard_index(&page)].remove(&page)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}

/// Statistics for a sharded directory
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStats {
    pub total_entries: usize,
    pub total_reads: u64,
    pub total_writes: u64,
    pub shard_entry_counts: Vec<usize>,
}

// =============================================================================
// Tests
// =============================================================================
