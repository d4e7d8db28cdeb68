//! Binary buddy allocator for compressed page images
//!
//! Whole slots are lent to the allocator as *hosts* and split into power of
//! two blocks between `min_size` and the page size. A block of class `i` has
//! size `min_size << i`; class [`BuddySizes::full_class`] is a whole slot.
//!
//! ```text
//!  host slot (page_size = 4096, min_size = 512)
//!  ┌───────────────────────────────┬───────────────┬───────┬───────┐
//!  │           class 2             │    class 1    │   0   │   0   │
//!  └───────────────────────────────┴───────────────┴───────┴───────┘
//!  buddy(addr, i) = addr.offset ^ (min_size << i)
//! ```
//!
//! [`BuddyState`] is the pure bookkeeping (free lists and stamps) protected
//! by the pool's buddy lock. [`Buddy`] ties it to the pool: it obtains and
//! returns host slots, copies bytes between frames and relocates images so
//! that a used buddy does not block coalescing.
//!
//! Lock order: per-page zip lock, then buddy state, then frame latches. Host
//! slots are taken from and returned to the pool with the buddy lock
//! released; relocation only `try_lock`s per-page locks.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace, warn};

use crate::buf::block::{SlotId, SlotState, ZipRef};
use crate::buf::pool::{BufferPool, PinnedPage};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::page::{self, header};

// =============================================================================
// Addresses and sizes
// =============================================================================

/// Start of a block: host slot plus byte offset in its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockAddr {
    pub slot: SlotId,
    pub offset: u32,
}

impl BlockAddr {
    pub fn new(slot: SlotId, offset: u32) -> Self {
        Self { slot, offset }
    }
}

impl From<ZipRef> for BlockAddr {
    fn from(z: ZipRef) -> Self {
        BlockAddr::new(z.slot, z.offset)
    }
}

/// What the side table knows about a block start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// On free list `class`
    Free(u8),
    /// Handed out as a block of `class`
    Used(u8),
}

/// Size classes derived from the page size and the minimum block size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddySizes {
    min_size: usize,
    full_class: usize,
}

impl BuddySizes {
    pub fn new(min_size: usize, page_size: usize) -> Self {
        Self {
            min_size,
            full_class: (page_size / min_size).trailing_zeros() as usize,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.buddy.min_size, config.page_size)
    }

    /// Block size of `class`
    #[inline]
    pub fn size(&self, class: usize) -> usize {
        self.min_size << class
    }

    /// The class of a whole host slot
    #[inline]
    pub fn full_class(&self) -> usize {
        self.full_class
    }

    /// Smallest class holding `len` bytes
    pub fn class_for(&self, len: usize) -> Option<usize> {
        (0..=self.full_class).find(|&c| self.size(c) >= len)
    }
}

/// How [`Buddy::alloc`] may obtain a new host slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    /// Only a slot already on the pool free list
    FreeListOnly,
    /// May evict from the LRU tail
    Evict,
}

/// Split, merge and relocation counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuddyEvents {
    pub splits: u64,
    pub merges: u64,
    pub relocations: u64,
    pub relocation_failures: u64,
}

impl BuddyEvents {
    fn add(&mut self, other: BuddyEvents) {
        self.splits += other.splits;
        self.merges += other.merges;
        self.relocations += other.relocations;
        self.relocation_failures += other.relocation_failures;
    }
}

/// Allocator occupancy
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuddyStats {
    pub hosts: usize,
    /// Free blocks per class below the full class
    pub free_blocks: Vec<usize>,
    /// Used blocks per class, full class included
    pub used_blocks: Vec<usize>,
    pub totals: BuddyEvents,
}

// =============================================================================
// Buddy State
// =============================================================================

/// Free lists and stamps of every block inside the registered hosts
#[derive(Debug)]
pub struct BuddyState {
    sizes: BuddySizes,
    /// One ordered set per class below the full class
    free: Vec<BTreeSet<BlockAddr>>,
    stamps: HashMap<BlockAddr, Stamp>,
    hosts: BTreeSet<SlotId>,
    skip_threshold: usize,
    pending: BuddyEvents,
    totals: BuddyEvents,
}

impl BuddyState {
    pub fn new(sizes: BuddySizes, skip_threshold: usize) -> Self {
        Self {
            sizes,
            free: vec![BTreeSet::new(); sizes.full_class()],
            stamps: HashMap::new(),
            hosts: BTreeSet::new(),
            skip_threshold,
            pending: BuddyEvents::default(),
            totals: BuddyEvents::default(),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            BuddySizes::from_config(config),
            config.buddy.coalesce_skip_threshold,
        )
    }

    pub fn sizes(&self) -> BuddySizes {
        self.sizes
    }

    pub fn free_len(&self, class: usize) -> usize {
        self.free.get(class).map_or(0, |l| l.len())
    }

    pub fn hosts(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.hosts.iter().copied()
    }

    pub fn is_host(&self, slot: SlotId) -> bool {
        self.hosts.contains(&slot)
    }

    pub fn stamp(&self, addr: BlockAddr) -> Option<Stamp> {
        self.stamps.get(&addr).copied()
    }

    fn push_free(&mut self, addr: BlockAddr, class: usize) {
        self.stamps.insert(addr, Stamp::Free(class as u8));
        self.free[class].insert(addr);
    }

    fn unlink_free(&mut self, addr: BlockAddr, class: usize) {
        self.free[class].remove(&addr);
        self.stamps.remove(&addr);
    }

    /// Pop a block of `class`, splitting larger free blocks as needed
    fn take_free(&mut self, class: usize) -> Option<BlockAddr> {
        if class >= self.sizes.full_class() {
            return None;
        }
        if let Some(addr) = self.free[class].pop_first() {
            self.stamps.remove(&addr);
            return Some(addr);
        }
        let larger = self.take_free(class + 1)?;
        let upper = BlockAddr::new(larger.slot, larger.offset + self.sizes.size(class) as u32);
        self.push_free(upper, class);
        self.pending.splits += 1;
        Some(larger)
    }

    /// Allocate from the free lists only
    pub fn alloc_from_lists(&mut self, class: usize) -> Option<BlockAddr> {
        let addr = self.take_free(class)?;
        self.stamps.insert(addr, Stamp::Used(class as u8));
        Some(addr)
    }

    /// Register `slot` as a host and carve a block of `class` from its start;
    /// the upper halves go to the free lists.
    pub fn alloc_from_slot(&mut self, slot: SlotId, class: usize) -> BlockAddr {
        self.hosts.insert(slot);
        for j in (class..self.sizes.full_class()).rev() {
            self.push_free(BlockAddr::new(slot, self.sizes.size(j) as u32), j);
            self.pending.splits += 1;
        }
        let addr = BlockAddr::new(slot, 0);
        self.stamps.insert(addr, Stamp::Used(class as u8));
        addr
    }

    /// Free a used block and coalesce.
    ///
    /// `relocate(src, dst, class)` is asked to move a used buddy into a free
    /// block of the same class; on success the pair is merged. Returns the
    /// host slot once a block grows back to a whole slot. The error string
    /// describes a broken stamp.
    pub fn release<F>(
        &mut self,
        addr: BlockAddr,
        class: usize,
        shrinking: bool,
        relocate: &mut F,
    ) -> std::result::Result<Option<SlotId>, String>
    where
        F: FnMut(BlockAddr, BlockAddr, usize) -> bool,
    {
        match self.stamps.get(&addr) {
            Some(Stamp::Used(c)) if *c as usize == class => {}
            other => {
                return Err(format!(
                    "release of {:?} as class {}: stamp is {:?}",
                    addr, class, other
                ))
            }
        }
        self.stamps.remove(&addr);

        let mut addr = addr;
        let mut class = class;
        loop {
            if class == self.sizes.full_class() {
                self.hosts.remove(&addr.slot);
                return Ok(Some(addr.slot));
            }
            if !shrinking && self.free[class].len() >= self.skip_threshold {
                break;
            }

            let size = self.sizes.size(class) as u32;
            let buddy = BlockAddr::new(addr.slot, addr.offset ^ size);
            match self.stamps.get(&buddy).copied() {
                Some(Stamp::Free(c)) if c as usize == class => {
                    self.unlink_free(buddy, class);
                }
                Some(Stamp::Used(c)) if c as usize == class => {
                    let Some(target) = self.free[class].pop_first() else {
                        break;
                    };
                    self.stamps.remove(&target);
                    if relocate(buddy, target, class) {
                        self.stamps.remove(&buddy);
                        self.stamps.insert(target, Stamp::Used(class as u8));
                        self.pending.relocations += 1;
                    } else {
                        self.push_free(target, class);
                        self.pending.relocation_failures += 1;
                        break;
                    }
                }
                _ => break,
            }

            addr.offset = addr.offset.min(buddy.offset);
            class += 1;
            self.pending.merges += 1;
        }

        self.push_free(addr, class);
        Ok(None)
    }

    /// Take the counts accumulated since the last call
    pub fn drain_events(&mut self) -> BuddyEvents {
        let events = std::mem::take(&mut self.pending);
        self.totals.add(events);
        events
    }

    /// Every listed block is stamped free with its class, aligned and inside
    /// a registered host; every free stamp is listed; the stamped blocks of a
    /// host tile it exactly.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let full = self.sizes.size(self.sizes.full_class()) as u32;
        for (class, list) in self.free.iter().enumerate() {
            let size = self.sizes.size(class) as u32;
            for addr in list {
                if self.stamps.get(addr) != Some(&Stamp::Free(class as u8)) {
                    return Err(format!(
                        "{:?} on free list {} stamped {:?}",
                        addr,
                        class,
                        self.stamps.get(addr)
                    ));
                }
                if addr.offset % size != 0 || addr.offset + size > full {
                    return Err(format!("{:?} misaligned for class {}", addr, class));
                }
                if !self.hosts.contains(&addr.slot) {
                    return Err(format!("{:?} outside any host", addr));
                }
            }
        }

        let mut covered: HashMap<SlotId, u64> = HashMap::new();
        for (addr, stamp) in &self.stamps {
            let class = match *stamp {
                Stamp::Free(c) => {
                    if !self.free[c as usize].contains(addr) {
                        return Err(format!("{:?} stamped free but not listed", addr));
                    }
                    c
                }
                Stamp::Used(c) => c,
            };
            if !self.hosts.contains(&addr.slot) {
                return Err(format!("{:?} stamped {:?} outside any host", addr, stamp));
            }
            *covered.entry(addr.slot).or_default() += self.sizes.size(class as usize) as u64;
        }
        for host in &self.hosts {
            let bytes = covered.get(host).copied().unwrap_or(0);
            if bytes != full as u64 {
                return Err(format!("{} blocks cover {} of {} bytes", host, bytes, full));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> BuddyStats {
        let mut used = vec![0; self.sizes.full_class() + 1];
        for stamp in self.stamps.values() {
            if let Stamp::Used(c) = stamp {
                used[*c as usize] += 1;
            }
        }
        BuddyStats {
            hosts: self.hosts.len(),
            free_blocks: self.free.iter().map(|l| l.len()).collect(),
            used_blocks: used,
            totals: self.totals,
        }
    }

    fn describe(&self) -> String {
        let stats = self.stats();
        format!(
            "buddy: {} hosts, free per class {:?}, used per class {:?}",
            stats.hosts, stats.free_blocks, stats.used_blocks
        )
    }
}

// =============================================================================
// Pool facade
// =============================================================================

/// Buddy operations of a [`BufferPool`]
pub struct Buddy<'a> {
    pool: &'a BufferPool,
}

impl BufferPool {
    pub fn buddy(&self) -> Buddy<'_> {
        Buddy { pool: self }
    }
}

impl<'a> Buddy<'a> {
    pub fn sizes(&self) -> BuddySizes {
        self.pool.buddy_sizes
    }

    fn check_class(&self, class: usize) -> Result<()> {
        let sizes = self.sizes();
        if class > sizes.full_class() {
            return Err(Error::InvalidBlockSize {
                size: sizes.size(class),
                min: sizes.size(0),
                max: sizes.size(sizes.full_class()),
            });
        }
        Ok(())
    }

    fn publish(&self, events: BuddyEvents) {
        let m = &self.pool.metrics;
        m.buddy_splits.inc_by(events.splits);
        m.buddy_merges.inc_by(events.merges);
        m.buddy_relocations.inc_by(events.relocations);
        m.buddy_relocation_failures.inc_by(events.relocation_failures);
    }

    /// Allocate a block of `class`.
    ///
    /// Returns `None` only with [`SlotSource::FreeListOnly`] when no slot is
    /// free.
    pub fn alloc(&self, class: usize, source: SlotSource) -> Result<Option<BlockAddr>> {
        self.check_class(class)?;
        {
            let mut state = self.pool.buddy_state.lock()?;
            if let Some(addr) = state.alloc_from_lists(class) {
                let events = state.drain_events();
                drop(state);
                self.publish(events);
                trace!(?addr, class, "buddy block from free lists");
                return Ok(Some(addr));
            }
        }

        let slot = match source {
            SlotSource::FreeListOnly => match self.pool.pop_free_slot()? {
                Some(slot) => slot,
                None => return Ok(None),
            },
            SlotSource::Evict => self.pool.acquire_free_slot()?,
        };
        self.pool.lend_slot(slot)?;

        let mut state = self.pool.buddy_state.lock()?;
        let addr = state.alloc_from_slot(slot, class);
        let events = state.drain_events();
        drop(state);
        self.publish(events);
        debug!(%slot, class, "new buddy host");
        Ok(Some(addr))
    }

    /// Free a block of `class`; a fully coalesced host goes back to the pool
    pub fn free(&self, addr: BlockAddr, class: usize) -> Result<()> {
        if let Some(host) = self.release(addr, class)? {
            self.pool.reclaim_slot(host)?;
        }
        Ok(())
    }

    /// Free without returning the host slot; the caller owns the result
    pub(crate) fn release(&self, addr: BlockAddr, class: usize) -> Result<Option<SlotId>> {
        self.check_class(class)?;
        let shrinking = self.pool.is_shrinking();
        let mut state = self.pool.buddy_state.lock()?;
        // A shrinking pool must empty hosts, so owners are searched everywhere
        let outcome = state.release(addr, class, shrinking, &mut |src, dst, c| {
            self.relocate(src, dst, c, shrinking)
        });
        let events = state.drain_events();
        match outcome {
            Ok(host) => {
                drop(state);
                self.publish(events);
                if let Some(slot) = host {
                    debug!(%slot, "buddy host fully coalesced");
                }
                Ok(host)
            }
            Err(detail) => {
                let err = Error::invariant("buddy", detail);
                Err(self.pool.config.fatal_policy.escalate(err, || state.describe()))
            }
        }
    }

    /// Move the compressed image of `page` to a block sized for `new_len`.
    ///
    /// Uses free lists and free slots only; `false` when nothing fits, the
    /// image would not fit the new block or the page has no image.
    pub fn realloc(&self, page: &PinnedPage<'_>, new_len: usize) -> Result<bool> {
        let sizes = self.sizes();
        let class = sizes.class_for(new_len).ok_or(Error::InvalidBlockSize {
            size: new_len,
            min: sizes.size(0),
            max: sizes.size(sizes.full_class()),
        })?;
        let block = self.pool.block(page.slot());
        match block.zip_ref() {
            None => return Ok(false),
            Some(old) if old.len as usize > sizes.size(class) => {
                debug!(
                    page = %page.page_id(),
                    len = old.len,
                    class,
                    "realloc refused: image does not fit the new block"
                );
                return Ok(false);
            }
            Some(_) => {}
        }
        let Some(addr) = self.alloc(class, SlotSource::FreeListOnly)? else {
            return Ok(false);
        };

        // The image may have been replaced since the check above
        let old = {
            let mut zip = block.zip.lock();
            match *zip {
                Some(old) if old.len as usize <= sizes.size(class) => {
                    self.copy(old.into(), addr, old.len as usize);
                    *zip = Some(ZipRef {
                        slot: addr.slot,
                        offset: addr.offset,
                        class: class as u8,
                        len: old.len,
                    });
                    Some(old)
                }
                _ => None,
            }
        };

        match old {
            Some(old) => {
                self.free(old.into(), old.class as usize)?;
                Ok(true)
            }
            None => {
                self.free(addr, class)?;
                Ok(false)
            }
        }
    }

    /// Move the used block `src` of `class` to `dst` and retarget the page
    /// descriptor pointing at it.
    ///
    /// The owner is found through the page id in the image header; `force`
    /// falls back to scanning every slot. Gives up when the owner's
    /// descriptor is busy or does not point at `src`. Must be called with
    /// the buddy lock held.
    pub fn relocate(&self, src: BlockAddr, dst: BlockAddr, class: usize, force: bool) -> bool {
        let owner_page = {
            let Some(frame) = self.pool.block(src.slot).frame.try_read() else {
                return false;
            };
            let start = src.offset as usize;
            page::page_id(&frame[start..start + header::LEN])
        };

        let matches = |z: &ZipRef| {
            z.slot == src.slot && z.offset == src.offset && z.class as usize == class
        };

        let owner = self.pool.directory.lookup(owner_page);
        let mut candidates: Vec<SlotId> = owner.into_iter().collect();
        if force {
            candidates.extend(
                self.pool
                    .blocks
                    .iter()
                    .map(|b| b.id())
                    .filter(|id| Some(*id) != owner),
            );
        }

        for slot in candidates {
            let block = self.pool.block(slot);
            let Some(mut zip) = block.zip.try_lock() else {
                if !force {
                    return false;
                }
                continue;
            };
            let Some(current) = *zip else {
                continue;
            };
            if !matches(&current) {
                continue;
            }
            self.copy(src, dst, current.len as usize);
            *zip = Some(ZipRef {
                slot: dst.slot,
                offset: dst.offset,
                ..current
            });
            trace!(?src, ?dst, class, page = %owner_page, "relocated compressed image");
            return true;
        }
        if force {
            warn!(?src, class, page = %owner_page, "no owner found for buddy block");
        }
        false
    }

    /// Copy `len` bytes between blocks; latches are taken in slot order
    fn copy(&self, from: BlockAddr, to: BlockAddr, len: usize) {
        let (src_start, dst_start) = (from.offset as usize, to.offset as usize);
        if from.slot == to.slot {
            let mut frame = self.pool.block(from.slot).frame.write();
            frame.copy_within(src_start..src_start + len, dst_start);
        } else if from.slot < to.slot {
            let src = self.pool.block(from.slot).frame.read();
            let mut dst = self.pool.block(to.slot).frame.write();
            dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
        } else {
            let mut dst = self.pool.block(to.slot).frame.write();
            let src = self.pool.block(from.slot).frame.read();
            dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
        }
    }

    /// Structural check of the buddy state; hosts must be lent slots
    pub fn validate(&self) -> Result<()> {
        let hosts: Vec<SlotId> = {
            let state = self.pool.buddy_state.lock()?;
            if let Err(detail) = state.validate() {
                let err = Error::invariant("buddy", detail);
                return Err(self.pool.config.fatal_policy.escalate(err, || state.describe()));
            }
            state.hosts().collect()
        };
        let lru = self.pool.lru_state.lock()?;
        for host in hosts {
            if lru.state_of(host) != SlotState::Memory {
                let err = Error::invariant(
                    "buddy",
                    format!("host {} is in state {:?}", host, lru.state_of(host)),
                );
                return Err(self.pool.config.fatal_policy.escalate(err, || {
                    format!("{} host(s) checked", lru.count_in_state(SlotState::Memory))
                }));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<BuddyStats> {
        Ok(self.pool.buddy_state.lock()?.stats())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BuddyState {
        // 4096 byte slots, 512 byte minimum: classes 0..=3
        BuddyState::new(BuddySizes::new(512, 4096), 16)
    }

    fn never(_: BlockAddr, _: BlockAddr, _: usize) -> bool {
        false
    }

    #[test]
    fn test_sizes() {
        let s = BuddySizes::new(1024, 16384);
        assert_eq!(s.full_class(), 4);
        assert_eq!(s.size(0), 1024);
        assert_eq!(s.size(4), 16384);
        assert_eq!(s.class_for(1), Some(0));
        assert_eq!(s.class_for(1025), Some(1));
        assert_eq!(s.class_for(16384), Some(4));
        assert_eq!(s.class_for(16385), None);
    }

    #[test]
    fn test_split_from_new_host() {
        let mut st = state();
        assert_eq!(st.alloc_from_lists(0), None);

        let a = st.alloc_from_slot(SlotId(7), 0);
        assert_eq!(a, BlockAddr::new(SlotId(7), 0));
        assert_eq!(st.free_len(0), 1);
        assert_eq!(st.free_len(1), 1);
        assert_eq!(st.free_len(2), 1);
        assert_eq!(st.stamp(BlockAddr::new(SlotId(7), 2048)), Some(Stamp::Free(2)));
        assert!(st.validate().is_ok());

        // Next two class 0 blocks: the listed buddy, then a split of class 1
        assert_eq!(st.alloc_from_lists(0), Some(BlockAddr::new(SlotId(7), 512)));
        assert_eq!(st.alloc_from_lists(0), Some(BlockAddr::new(SlotId(7), 1024)));
        assert_eq!(st.free_len(0), 1);
        assert_eq!(st.free_len(1), 0);
        assert!(st.validate().is_ok());
        assert_eq!(st.drain_events().splits, 4);
    }

    #[test]
    fn test_free_coalesces_to_host() {
        let mut st = state();
        let a = st.alloc_from_slot(SlotId(1), 0);
        let b = st.alloc_from_lists(0).unwrap();

        assert_eq!(st.release(a, 0, false, &mut never), Ok(None));
        assert_eq!(st.free_len(0), 1);
        assert_eq!(st.release(b, 0, false, &mut never), Ok(Some(SlotId(1))));
        assert!(!st.is_host(SlotId(1)));
        assert!(st.stamps.is_empty());
        assert!(st.validate().is_ok());
    }

    #[test]
    fn test_full_class_block() {
        let mut st = state();
        let a = st.alloc_from_slot(SlotId(3), 3);
        assert_eq!(st.free_len(0) + st.free_len(1) + st.free_len(2), 0);
        assert_eq!(st.release(a, 3, false, &mut never), Ok(Some(SlotId(3))));
    }

    #[test]
    fn test_release_rejects_wrong_class() {
        let mut st = state();
        let a = st.alloc_from_slot(SlotId(1), 1);
        assert!(st.release(a, 0, false, &mut never).is_err());
        assert!(st
            .release(BlockAddr::new(SlotId(9), 0), 0, false, &mut never)
            .is_err());
    }

    #[test]
    fn test_used_buddy_relocated() {
        let mut st = state();
        let a = st.alloc_from_slot(SlotId(1), 0);
        let b = st.alloc_from_lists(0).unwrap();
        let _c = st.alloc_from_slot(SlotId(2), 0);
        let spare = BlockAddr::new(SlotId(2), 512);
        assert_eq!(st.stamp(spare), Some(Stamp::Free(0)));

        let mut moved = Vec::new();
        let mut accept = |src: BlockAddr, dst: BlockAddr, class: usize| {
            moved.push((src, dst, class));
            true
        };
        // b moves into host 2, so host 1 coalesces completely
        assert_eq!(st.release(a, 0, false, &mut accept), Ok(Some(SlotId(1))));
        assert_eq!(moved, vec![(b, spare, 0)]);
        assert_eq!(st.stamp(spare), Some(Stamp::Used(0)));
        assert_eq!(st.stamp(b), None);
        assert!(st.validate().is_ok());
        assert_eq!(st.drain_events().relocations, 1);
    }

    #[test]
    fn test_refused_relocation_restores_target() {
        let mut st = state();
        let a = st.alloc_from_slot(SlotId(1), 0);
        let _b = st.alloc_from_lists(0).unwrap();
        let _c = st.alloc_from_slot(SlotId(2), 0);

        let mut refuse = |_: BlockAddr, _: BlockAddr, _: usize| false;
        assert_eq!(st.release(a, 0, false, &mut refuse), Ok(None));
        assert_eq!(st.free_len(0), 2);
        assert_eq!(st.stamp(BlockAddr::new(SlotId(2), 512)), Some(Stamp::Free(0)));
        assert_eq!(st.drain_events().relocation_failures, 1);
        assert!(st.validate().is_ok());
    }

    #[test]
    fn test_skip_threshold_unless_shrinking() {
        let mut st = BuddyState::new(BuddySizes::new(512, 1024), 1);
        let a = st.alloc_from_slot(SlotId(1), 0);
        let b = st.alloc_from_lists(0).unwrap();
        let c = st.alloc_from_slot(SlotId(2), 0);

        // List 0 holds host 2's upper half: coalescing is skipped
        st.release(a, 0, false, &mut never).unwrap();
        assert_eq!(st.free_len(0), 2);
        assert!(st.is_host(SlotId(1)));

        // Shrinking coalesces regardless
        assert_eq!(st.release(b, 0, true, &mut never), Ok(Some(SlotId(1))));
        assert_eq!(st.release(c, 0, true, &mut never), Ok(Some(SlotId(2))));
        assert!(st.validate().is_ok());
    }

    #[test]
    fn test_validate_detects_unlisted_free_stamp() {
        let mut st = state();
        let _a = st.alloc_from_slot(SlotId(1), 2);
        let upper = BlockAddr::new(SlotId(1), 2048);
        st.free[2].remove(&upper);
        assert!(st.validate().is_err());
    }
}
