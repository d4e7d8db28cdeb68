//! Property-Based Tests for the LRU list and the buddy allocator
//!
//! # Test Properties
//!
//! 1. **Old segment ratio**: once the list is long enough, the old segment
//!    stays within tolerance of 3/8 of the list
//! 2. **Positions**: positions never increase from head to tail
//! 3. **Coalescing**: the eight minimum blocks of one slot merge back into
//!    the slot whatever order they are freed in
//! 4. **Buddy structure**: arbitrary alloc/free sequences keep the free
//!    lists and stamps consistent and release every host at the end

#![cfg(test)]

use proptest::prelude::*;

use super::block::SlotId;
use super::buddy::{BlockAddr, BuddySizes, BuddyState};
use super::lru::LruList;

// =============================================================================
// Property Strategies
// =============================================================================

const SLOTS: usize = 160;

#[derive(Debug, Clone, Copy)]
enum LruOp {
    Add(usize, bool),
    Remove(usize),
    MakeYoung(usize),
    MakeOld(usize),
}

/// Adds dominate so that lists regularly cross the old threshold
fn lru_op_strategy() -> impl Strategy<Value = LruOp> {
    prop_oneof![
        6 => (0..SLOTS, any::<bool>()).prop_map(|(s, old)| LruOp::Add(s, old)),
        2 => (0..SLOTS).prop_map(LruOp::Remove),
        1 => (0..SLOTS).prop_map(LruOp::MakeYoung),
        1 => (0..SLOTS).prop_map(LruOp::MakeOld),
    ]
}

#[derive(Debug, Clone, Copy)]
enum BuddyOp {
    Alloc(usize),
    Free(usize),
}

fn buddy_op_strategy() -> impl Strategy<Value = BuddyOp> {
    prop_oneof![
        3 => (0usize..=3).prop_map(BuddyOp::Alloc),
        2 => any::<usize>().prop_map(BuddyOp::Free),
    ]
}

fn apply(list: &mut LruList, op: LruOp) {
    match op {
        LruOp::Add(s, old) if !list.contains(SlotId(s as u32)) => list.add(SlotId(s as u32), old),
        LruOp::Remove(s) if list.contains(SlotId(s as u32)) => list.remove(SlotId(s as u32)),
        LruOp::MakeYoung(s) if list.contains(SlotId(s as u32)) => {
            list.make_young(SlotId(s as u32))
        }
        LruOp::MakeOld(s) if list.contains(SlotId(s as u32)) => list.make_old(SlotId(s as u32)),
        _ => {}
    }
}

// =============================================================================
// LRU Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the old segment length stays within tolerance of 3/8.
    #[test]
    fn prop_old_segment_ratio(
        ops in prop::collection::vec(lru_op_strategy(), 1..600),
        tolerance in 1usize..=3,
    ) {
        let min_len = 16;
        let mut list = LruList::new(SLOTS, min_len, tolerance);
        for op in ops {
            apply(&mut list, op);
            prop_assert!(list.validate().is_ok(), "{:?}", list.validate());

            let (len, old) = (list.len() as i64, list.old_len() as i64);
            if list.len() >= min_len {
                prop_assert!((8 * old - 3 * len).abs() <= 8 * tolerance as i64);
                prop_assert!(list.old_marker().is_some());
            } else {
                prop_assert_eq!(old, 0);
                prop_assert!(list.old_marker().is_none());
            }
        }
    }

    /// Property: positions are non-increasing from head to tail.
    #[test]
    fn prop_positions_non_increasing(
        ops in prop::collection::vec(lru_op_strategy(), 1..400),
    ) {
        let mut list = LruList::new(SLOTS, 16, 2);
        for op in ops {
            apply(&mut list, op);
        }
        let positions: Vec<u32> = list.iter().map(|s| list.position(s)).collect();
        for pair in positions.windows(2) {
            prop_assert!(pair[0] >= pair[1], "{:?}", positions);
        }
    }
}

// =============================================================================
// Buddy Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: 8 minimum blocks of one slot freed in any order coalesce
    /// into exactly one whole slot.
    #[test]
    fn prop_min_blocks_coalesce_in_any_order(
        order in Just((0usize..8).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut state = BuddyState::new(BuddySizes::new(512, 4096), 16);
        let mut blocks = vec![state.alloc_from_slot(SlotId(0), 0)];
        for _ in 1..8 {
            blocks.push(state.alloc_from_lists(0).expect("slot has room"));
        }
        let mut offsets: Vec<u32> = blocks.iter().map(|b| b.offset).collect();
        offsets.sort_unstable();
        prop_assert_eq!(offsets, (0..8).map(|i| i * 512).collect::<Vec<u32>>());

        let mut never = |_: BlockAddr, _: BlockAddr, _: usize| false;
        for (n, &i) in order.iter().enumerate() {
            let host = state.release(blocks[i], 0, false, &mut never).map_err(|e| TestCaseError::fail(e))?;
            if n < 7 {
                prop_assert_eq!(host, None);
            } else {
                prop_assert_eq!(host, Some(SlotId(0)));
            }
            prop_assert!(state.validate().is_ok(), "{:?}", state.validate());
        }
        let stats = state.stats();
        prop_assert_eq!(stats.hosts, 0);
        prop_assert!(stats.free_blocks.iter().all(|&n| n == 0));
    }

    /// Property: mixed alloc/free sequences stay structurally valid and
    /// release every host once everything is freed.
    #[test]
    fn prop_alloc_free_sequences(
        ops in prop::collection::vec(buddy_op_strategy(), 1..200),
    ) {
        let mut state = BuddyState::new(BuddySizes::new(512, 4096), 1000);
        let mut live: Vec<(BlockAddr, usize)> = Vec::new();
        let mut next_slot = 0u32;
        let mut never = |_: BlockAddr, _: BlockAddr, _: usize| false;

        for op in ops {
            match op {
                BuddyOp::Alloc(class) => {
                    let addr = match state.alloc_from_lists(class) {
                        Some(addr) => addr,
                        None => {
                            next_slot += 1;
                            state.alloc_from_slot(SlotId(next_slot), class)
                        }
                    };
                    live.push((addr, class));
                }
                BuddyOp::Free(i) if !live.is_empty() => {
                    let (addr, class) = live.swap_remove(i % live.len());
                    state.release(addr, class, false, &mut never).map_err(|e| TestCaseError::fail(e))?;
                }
                BuddyOp::Free(_) => {}
            }
            prop_assert!(state.validate().is_ok(), "{:?}", state.validate());
        }

        for (addr, class) in live.drain(..) {
            state.release(addr, class, false, &mut never).map_err(|e| TestCaseError::fail(e))?;
        }
        prop_assert_eq!(state.stats().hosts, 0);
    }
}
