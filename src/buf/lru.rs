//! LRU list with a young/old split
//!
//! ```text
//!  head                                  old marker                  tail
//!   │                                        │                        │
//!   ▼                                        ▼                        ▼
//!  ┌───┐  ┌───┐  ┌───┐        ┌───┐       ┌───┐  ┌───┐        ┌───┐
//!  │ Y │──│ Y │──│ Y │── .. ──│ Y │───────│ O │──│ O │── .. ──│ O │
//!  └───┘  └───┘  └───┘        └───┘       └───┘  └───┘        └───┘
//!  ◀──────────── young (~5/8) ──────────▶ ◀───── old (~3/8) ─────────▶
//! ```
//!
//! New pages enter just behind the marker, at the head of the old segment,
//! so a one-off scan churns only the old segment. Pages reach the young
//! segment through [`LruList::make_young`].
//!
//! # Invariants
//!
//! - Once `len >= old_min_len` the marker is defined and
//!   `|old_len - 3/8 * len| <= old_tolerance` (checked as
//!   `|8 * old_len - 3 * len| <= 8 * old_tolerance`).
//! - Below the threshold the marker is undefined and no slot is old.
//! - Positions never increase from head to tail, except at one point where
//!   the u32 clock wrapped.
//!
//! Links are slot indices into a node arena sized to the pool, so the list
//! never allocates after construction.

use std::collections::VecDeque;

use super::block::{SlotId, SlotMeta, SlotState};
use crate::config::LruConfig;

#[derive(Debug, Clone, Copy, Default)]
struct LruNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    in_lru: bool,
    old: bool,
    position: u32,
}

/// Index-linked LRU list over the slot arena
#[derive(Debug, Clone)]
pub struct LruList {
    nodes: Vec<LruNode>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
    /// First slot of the old segment
    old: Option<SlotId>,
    old_len: usize,
    clock: u32,
    min_len: usize,
    tolerance: usize,
}

impl LruList {
    pub fn new(capacity: usize, min_len: usize, tolerance: usize) -> Self {
        Self {
            nodes: vec![LruNode::default(); capacity],
            head: None,
            tail: None,
            len: 0,
            old: None,
            old_len: 0,
            clock: 0,
            min_len,
            tolerance,
        }
    }

    pub fn from_config(capacity: usize, config: &LruConfig) -> Self {
        Self::new(capacity, config.old_min_len, config.old_tolerance)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn old_len(&self) -> usize {
        self.old_len
    }

    pub fn head(&self) -> Option<SlotId> {
        self.head
    }

    pub fn tail(&self) -> Option<SlotId> {
        self.tail
    }

    /// First slot of the old segment, if the segment is maintained
    pub fn old_marker(&self) -> Option<SlotId> {
        self.old
    }

    pub fn min_len(&self) -> usize {
        self.min_len
    }

    pub fn tolerance(&self) -> usize {
        self.tolerance
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.nodes[slot.index()].in_lru
    }

    pub fn is_old(&self, slot: SlotId) -> bool {
        self.nodes[slot.index()].old
    }

    pub fn position(&self, slot: SlotId) -> u32 {
        self.nodes[slot.index()].position
    }

    pub fn prev(&self, slot: SlotId) -> Option<SlotId> {
        self.nodes[slot.index()].prev
    }

    pub fn next(&self, slot: SlotId) -> Option<SlotId> {
        self.nodes[slot.index()].next
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// Start the position clock at `clock`
    pub fn set_clock(&mut self, clock: u32) {
        self.clock = clock;
    }

    /// Number of positions between `slot` and the head
    pub fn distance_from_head(&self, slot: SlotId) -> u32 {
        match self.head {
            Some(h) => self.position(h).wrapping_sub(self.position(slot)),
            None => 0,
        }
    }

    /// Positions above this count as recently used: the head position minus
    /// `len / divisor`, or 0 while the list is below the old threshold.
    pub fn recent_limit(&self, divisor: usize) -> u32 {
        match self.head {
            Some(h) if self.len >= self.min_len => self
                .position(h)
                .wrapping_sub((self.len / divisor.max(1)) as u32),
            _ => 0,
        }
    }

    /// Slots from head to tail
    pub fn iter(&self) -> LruIter<'_> {
        LruIter {
            list: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Slots from tail to head
    pub fn iter_from_tail(&self) -> LruIter<'_> {
        LruIter {
            list: self,
            cursor: self.tail,
            forward: false,
        }
    }

    fn tic(&mut self) -> u32 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    // =========================================================================
    // Insertion and removal
    // =========================================================================

    /// Insert `slot`; at the head of the old segment when `as_old`, else at
    /// the head of the list. Below the old threshold always at the head.
    pub fn add(&mut self, slot: SlotId, as_old: bool) {
        debug_assert!(!self.contains(slot), "{} already on the LRU list", slot);
        match self.old {
            Some(marker) if as_old && self.len >= self.min_len => {
                self.link_after(slot, marker);
                self.nodes[slot.index()].old = true;
                self.old_len += 1;
            }
            _ => self.link_head(slot),
        }
        self.after_grow();
    }

    /// Unlink `slot`
    pub fn remove(&mut self, slot: SlotId) {
        debug_assert!(self.contains(slot), "{} not on the LRU list", slot);
        let node = self.nodes[slot.index()];

        if self.old == Some(slot) {
            match node.prev {
                Some(p) => {
                    self.nodes[p.index()].old = true;
                    self.old = Some(p);
                    self.old_len += 1;
                }
                None => self.old = node.next,
            }
        }

        match node.prev {
            Some(p) => self.nodes[p.index()].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes[n.index()].prev = node.prev,
            None => self.tail = node.prev,
        }
        self.nodes[slot.index()] = LruNode {
            position: node.position,
            ..LruNode::default()
        };
        self.len -= 1;
        if node.old {
            self.old_len -= 1;
        }

        if self.len < self.min_len {
            if self.old.is_some() {
                let mut cursor = self.head;
                while let Some(s) = cursor {
                    self.nodes[s.index()].old = false;
                    cursor = self.nodes[s.index()].next;
                }
            }
            self.old = None;
            self.old_len = 0;
            return;
        }
        self.adjust_old_len();
    }

    /// Move `slot` to the head with a fresh position
    pub fn make_young(&mut self, slot: SlotId) {
        self.remove(slot);
        self.add(slot, false);
    }

    /// Move `slot` to the tail, taking over the tail's position
    pub fn make_old(&mut self, slot: SlotId) {
        self.remove(slot);
        let position = match self.tail {
            Some(t) => self.position(t),
            None => self.tic(),
        };
        let node = &mut self.nodes[slot.index()];
        node.prev = self.tail;
        node.next = None;
        node.in_lru = true;
        node.old = false;
        node.position = position;
        match self.tail {
            Some(t) => self.nodes[t.index()].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;

        if self.len > self.min_len {
            // The tail always belongs to the old segment
            self.nodes[slot.index()].old = true;
            self.old_len += 1;
        }
        self.after_grow();
    }

    fn link_head(&mut self, slot: SlotId) {
        let position = self.tic();
        let node = &mut self.nodes[slot.index()];
        node.prev = None;
        node.next = self.head;
        node.in_lru = true;
        node.old = false;
        node.position = position;
        match self.head {
            Some(h) => self.nodes[h.index()].prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.len += 1;
    }

    fn link_after(&mut self, slot: SlotId, after: SlotId) {
        let next = self.nodes[after.index()].next;
        let position = self.nodes[after.index()].position;
        let node = &mut self.nodes[slot.index()];
        node.prev = Some(after);
        node.next = next;
        node.in_lru = true;
        node.position = position;
        self.nodes[after.index()].next = Some(slot);
        match next {
            Some(n) => self.nodes[n.index()].prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.len += 1;
    }

    fn after_grow(&mut self) {
        if self.len > self.min_len {
            self.adjust_old_len();
        } else if self.len == self.min_len {
            self.init_old();
        }
    }

    /// Mark the whole list old and pull the marker back to 3/8
    fn init_old(&mut self) {
        let mut cursor = self.head;
        while let Some(s) = cursor {
            self.nodes[s.index()].old = true;
            cursor = self.nodes[s.index()].next;
        }
        self.old = self.head;
        self.old_len = self.len;
        self.adjust_old_len();
    }

    /// Step the marker one slot at a time until the old segment is within
    /// tolerance of 3/8 of the list.
    fn adjust_old_len(&mut self) {
        let Some(mut marker) = self.old else {
            return;
        };
        let tolerance = 8 * self.tolerance;
        loop {
            let target = 3 * self.len;
            let old = 8 * self.old_len;
            if old + tolerance < target {
                match self.nodes[marker.index()].prev {
                    Some(p) => {
                        self.nodes[p.index()].old = true;
                        marker = p;
                        self.old_len += 1;
                    }
                    None => break,
                }
            } else if old > target + tolerance {
                match self.nodes[marker.index()].next {
                    Some(n) => {
                        self.nodes[marker.index()].old = false;
                        marker = n;
                        self.old_len -= 1;
                    }
                    None => break,
                }
            } else {
                break;
            }
        }
        self.old = Some(marker);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check every structural invariant; returns a description of the first
    /// violation.
    pub fn validate(&self) -> Result<(), String> {
        let mut count = 0usize;
        let mut old_count = 0usize;
        let mut prev: Option<SlotId> = None;
        let mut cursor = self.head;
        let mut in_old = false;
        let mut last_position: Option<u32> = None;
        let mut wraps = 0;

        while let Some(slot) = cursor {
            let node = &self.nodes[slot.index()];
            if !node.in_lru {
                return Err(format!("{} linked but not marked in LRU", slot));
            }
            if node.prev != prev {
                return Err(format!(
                    "{} has prev {:?}, expected {:?}",
                    slot, node.prev, prev
                ));
            }
            if self.old == Some(slot) {
                in_old = true;
            }
            if node.old != in_old {
                return Err(format!(
                    "{} old flag is {}, expected {}",
                    slot, node.old, in_old
                ));
            }
            if node.old {
                old_count += 1;
            }
            if let Some(last) = last_position {
                if node.position > last {
                    wraps += 1;
                }
            }
            last_position = Some(node.position);
            count += 1;
            if count > self.nodes.len() {
                return Err("cycle in LRU list".into());
            }
            prev = Some(slot);
            cursor = node.next;
        }

        if self.tail != prev {
            return Err(format!("tail is {:?}, walk ended at {:?}", self.tail, prev));
        }
        if count != self.len {
            return Err(format!("length is {}, walked {}", self.len, count));
        }
        let flagged = self.nodes.iter().filter(|n| n.in_lru).count();
        if flagged != self.len {
            return Err(format!("{} slots flagged in LRU, length {}", flagged, self.len));
        }
        if old_count != self.old_len {
            return Err(format!(
                "old_len is {}, counted {}",
                self.old_len, old_count
            ));
        }
        if wraps > 1 {
            return Err(format!("positions increase {} times head to tail", wraps));
        }

        if self.len >= self.min_len {
            if self.old.is_none() {
                return Err(format!(
                    "old marker undefined at length {} >= {}",
                    self.len, self.min_len
                ));
            }
            let deviation = (8 * self.old_len).abs_diff(3 * self.len);
            if deviation > 8 * self.tolerance {
                return Err(format!(
                    "old_len {} deviates from 3/8 of {} beyond tolerance {}",
                    self.old_len, self.len, self.tolerance
                ));
            }
        } else if self.old.is_some() {
            return Err(format!(
                "old marker defined at length {} < {}",
                self.len, self.min_len
            ));
        }
        Ok(())
    }
}

/// Iterator over LRU slots
pub struct LruIter<'a> {
    list: &'a LruList,
    cursor: Option<SlotId>,
    forward: bool,
}

impl Iterator for LruIter<'_> {
    type Item = SlotId;

    fn next(&mut self) -> Option<SlotId> {
        let slot = self.cursor?;
        self.cursor = if self.forward {
            self.list.next(slot)
        } else {
            self.list.prev(slot)
        };
        Some(slot)
    }
}

// =============================================================================
// LRU State
// =============================================================================

/// Everything protected by the pool's LRU state lock
#[derive(Debug)]
pub struct LruState {
    pub lru: LruList,
    pub free: VecDeque<SlotId>,
    pub meta: Vec<SlotMeta>,
    /// Low-memory warning already emitted
    pub(crate) low_memory_warned: bool,
}

impl LruState {
    /// All `capacity` slots start on the free list
    pub fn new(capacity: usize, config: &LruConfig) -> Self {
        Self {
            lru: LruList::from_config(capacity, config),
            free: (0..capacity as u32).map(SlotId).collect(),
            meta: vec![SlotMeta::default(); capacity],
            low_memory_warned: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.meta.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Take the first free slot into `ReadyForUse`
    pub fn pop_free(&mut self) -> Option<SlotId> {
        let slot = self.free.pop_front()?;
        self.meta[slot.index()].state = SlotState::ReadyForUse;
        Some(slot)
    }

    /// Return a slot to the free list
    pub fn push_free(&mut self, slot: SlotId) {
        self.meta[slot.index()] = SlotMeta::default();
        self.free.push_back(slot);
    }

    pub fn state_of(&self, slot: SlotId) -> SlotState {
        self.meta[slot.index()].state
    }

    pub fn page_of(&self, slot: SlotId) -> Option<crate::page::PageId> {
        self.meta[slot.index()].page
    }

    pub fn count_in_state(&self, state: SlotState) -> usize {
        self.meta.iter().filter(|m| m.state == state).count()
    }

    /// LRU structure plus agreement between list membership, free list and
    /// slot states
    pub fn validate(&self) -> Result<(), String> {
        self.lru.validate()?;

        let mut on_free = vec![false; self.capacity()];
        for &slot in &self.free {
            if on_free[slot.index()] {
                return Err(format!("{} twice on the free list", slot));
            }
            on_free[slot.index()] = true;
            if self.lru.contains(slot) {
                return Err(format!("{} on both free and LRU lists", slot));
            }
            if self.state_of(slot) != SlotState::NotUsed {
                return Err(format!(
                    "{} on the free list in state {:?}",
                    slot,
                    self.state_of(slot)
                ));
            }
        }
        for (i, meta) in self.meta.iter().enumerate() {
            let slot = SlotId(i as u32);
            let in_lru = self.lru.contains(slot);
            match meta.state {
                SlotState::FilePage if !in_lru || meta.page.is_none() => {
                    return Err(format!("{} is a file page but not on the LRU list", slot));
                }
                SlotState::NotUsed if !on_free[i] => {
                    return Err(format!("{} not used but not on the free list", slot));
                }
                s if s != SlotState::FilePage && in_lru => {
                    return Err(format!("{} on the LRU list in state {:?}", slot, s));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
