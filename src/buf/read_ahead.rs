//! Random and linear read-ahead
//!
//! Tablespaces are divided into aligned *areas* of `read_ahead.area` pages.
//! Both triggers submit asynchronous reads for a whole area and return the
//! number submitted; neither waits for a latch the caller may hold, and both
//! take slots only through [`BufferPool::try_acquire_free_slot`].
//!
//! - **Random**: enough recently used pages of the area are cached, so the
//!   rest of the area is probably wanted too.
//! - **Linear**: the boundary page of an area is accessed for the first time
//!   after the area was walked in order; the neighbouring area the page
//!   chains into is read.

use tracing::{debug, trace, warn};

use crate::buf::pool::{BufferPool, RecoveryPhase};
use crate::error::Result;
use crate::page::{self, PageId};

/// Bounds `[low, high)` of the area containing `page_no`
pub fn area_bounds(page_no: u32, area: u32) -> (u32, u32) {
    let low = page_no / area * area;
    (low, low.saturating_add(area))
}

/// Whether LRU position `position` is above the recent cutoff `limit`
/// (0 means every position counts). Positions wrap.
fn is_recent(position: u32, limit: u32) -> bool {
    limit == 0 || position.wrapping_sub(limit) as i32 > 0
}

/// Read-ahead operations of a [`BufferPool`]
pub struct ReadAhead<'a> {
    pool: &'a BufferPool,
}

impl BufferPool {
    pub fn read_ahead(&self) -> ReadAhead<'_> {
        ReadAhead { pool: self }
    }
}

impl ReadAhead<'_> {
    fn area(&self) -> u32 {
        self.pool.config.read_ahead.area
    }

    /// Phase and pending-read checks shared by both triggers
    fn refused(&self) -> bool {
        if self.pool.recovery_phase() == RecoveryPhase::Startup {
            return true;
        }
        let limit = self.pool.capacity() / self.pool.config.read_ahead.pending_limit_divisor;
        let pending = self.pool.io().pending_reads();
        if pending > limit {
            debug!(pending, limit, "read-ahead refused: too many pending reads");
            return true;
        }
        false
    }

    fn space_size(&self, page: PageId) -> Option<u32> {
        let size = self.pool.store().space_size(page.space);
        if size.is_none() {
            warn!(space = %page.space, "read-ahead for a tablespace that does not exist");
        }
        size
    }

    /// Submit reads for `[low, high)` of `page`'s tablespace, skipping
    /// ordered pages
    fn read_area(&self, page: PageId, low: u32, high: u32) -> Result<usize> {
        let page_size = self.pool.page_size();
        let mut issued = 0;
        for no in low..high {
            let target = page.with_page_no(no);
            if page::is_ordered_page(target, page_size) {
                continue;
            }
            if self.pool.read_page_async(target)? {
                issued += 1;
            }
        }
        Ok(issued)
    }

    /// Read the area of `page` if at least `random_threshold` of its pages
    /// are cached, accessed and recent
    pub fn random(&self, page: PageId) -> Result<usize> {
        let config = &self.pool.config;
        if !config.read_ahead.random_enabled
            || page::is_ordered_page(page, config.page_size)
            || self.refused()
        {
            return Ok(0);
        }
        let Some(size) = self.space_size(page) else {
            return Ok(0);
        };
        let (low, high) = area_bounds(page.page_no, self.area());
        let high = high.min(size);
        if low >= high {
            return Ok(0);
        }

        let recent = {
            let state = self.pool.lru_state.lock()?;
            let limit = state.lru.recent_limit(config.read_ahead.recent_divisor);
            (low..high)
                .filter_map(|no| self.pool.peek(page.with_page_no(no)))
                .filter(|slot| {
                    state.lru.contains(*slot)
                        && self.pool.block(*slot).is_accessed()
                        && is_recent(state.lru.position(*slot), limit)
                })
                .count()
        };
        let threshold = config.random_threshold();
        if recent < threshold {
            trace!(%page, recent, threshold, "random read-ahead not triggered");
            return Ok(0);
        }

        let issued = self.read_area(page, low, high)?;
        self.pool.metrics.read_ahead_random.inc_by(issued as u64);
        debug!(%page, low, high, recent, issued, "random read-ahead");
        Ok(issued)
    }

    /// Read the neighbouring area when `page`, the first or last page of a
    /// fully accessed area, chains into it.
    ///
    /// At most `area - linear_threshold` pages of the area may be unaccessed
    /// or accessed out of order; order is the first-access sequence,
    /// ascending towards `page`.
    pub fn linear(&self, page: PageId) -> Result<usize> {
        let config = &self.pool.config;
        if !config.read_ahead.linear_enabled || page::is_ordered_page(page, config.page_size) {
            return Ok(0);
        }
        let area = self.area();
        let (low, high) = area_bounds(page.page_no, area);
        let ascending = page.page_no + 1 == high;
        if !ascending && page.page_no != low {
            return Ok(0);
        }
        let Some(size) = self.space_size(page) else {
            return Ok(0);
        };
        if high > size || self.refused() {
            return Ok(0);
        }

        let failures = {
            let _state = self.pool.lru_state.lock()?;
            let order: Vec<u32> = if ascending {
                (low..high).collect()
            } else {
                (low..high).rev().collect()
            };
            let mut failures = 0usize;
            let mut previous: Option<u64> = None;
            for no in order {
                let accessed = self
                    .pool
                    .peek(page.with_page_no(no))
                    .map(|slot| self.pool.block(slot))
                    .filter(|block| block.is_accessed());
                match accessed {
                    None => failures += 1,
                    Some(block) => {
                        let seq = block.access_seq();
                        if previous.is_some_and(|p| seq < p) {
                            failures += 1;
                        }
                        previous = Some(seq);
                    }
                }
            }
            failures
        };
        let allowed = (area as usize).saturating_sub(config.linear_threshold());
        if failures > allowed {
            trace!(%page, failures, allowed, "linear read-ahead not triggered");
            return Ok(0);
        }

        // The page's own links decide where the scan continues
        let Some(slot) = self.pool.peek(page) else {
            return Ok(0);
        };
        let (pred, succ) = {
            let Some(frame) = self.pool.block(slot).frame.try_read() else {
                return Ok(0);
            };
            (page::prev_page(&frame), page::next_page(&frame))
        };
        let next = if ascending {
            match (pred, succ) {
                (Some(p), Some(s)) if Some(p) == page.page_no.checked_sub(1) => s,
                _ => return Ok(0),
            }
        } else {
            match (pred, succ) {
                (Some(p), Some(s)) if s == page.page_no + 1 => p,
                _ => return Ok(0),
            }
        };

        let (new_low, new_high) = area_bounds(next, area);
        if new_low == low || (next != new_low && next + 1 != new_high) || new_high > size {
            return Ok(0);
        }

        let issued = self.read_area(page, new_low, new_high)?;
        self.pool.metrics.read_ahead_linear.inc_by(issued as u64);
        debug!(%page, new_low, new_high, issued, ascending, "linear read-ahead");
        Ok(issued)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::page::SpaceId;
    use crate::storage::{
        AsyncIo, InlineIo, MemStore, PageStore, PendingRead, ReadCompletion, ReadRequest,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn config(random: bool, linear: bool) -> PoolConfig {
        let mut config = PoolConfig::for_testing(32);
        config.read_ahead.random_enabled = random;
        config.read_ahead.linear_enabled = linear;
        config.read_ahead.area = 8;
        config.read_ahead.random_threshold = Some(1);
        config.read_ahead.linear_threshold = Some(6);
        config
    }

    fn pool(config: PoolConfig, pages: u32) -> (Arc<BufferPool>, Arc<InlineIo>) {
        let store = Arc::new(MemStore::new(config.page_size));
        store.create_space(SpaceId(1), pages);
        let io = Arc::new(InlineIo::new(store.clone()));
        let pool = BufferPool::builder(config, store)
            .io(io.clone())
            .build()
            .unwrap();
        (pool, io)
    }

    /// Holds completions until `complete_all`
    struct StalledIo {
        store: Arc<MemStore>,
        queued: Mutex<Vec<(ReadRequest, ReadCompletion)>>,
    }

    impl StalledIo {
        fn complete_all(&self) {
            let queued = std::mem::take(&mut *self.queued.lock());
            for (request, completion) in queued {
                let mut buf = vec![0u8; request.len];
                let result = self.store.read_page(request.page, &mut buf).map(|_| buf);
                completion(result);
            }
        }
    }

    impl AsyncIo for StalledIo {
        fn submit_read(
            &self,
            request: ReadRequest,
            completion: ReadCompletion,
        ) -> Result<PendingRead> {
            let page = request.page;
            self.queued.lock().push((request, completion));
            Ok(PendingRead { id: 0, page })
        }

        fn pending_reads(&self) -> usize {
            self.queued.lock().len()
        }
    }

    fn get(pool: &BufferPool, page_no: u32) {
        let _ = pool.get_page(PageId::new(1, page_no)).unwrap();
    }

    #[test]
    fn test_area_bounds() {
        assert_eq!(area_bounds(0, 64), (0, 64));
        assert_eq!(area_bounds(63, 64), (0, 64));
        assert_eq!(area_bounds(64, 64), (64, 128));
        assert_eq!(area_bounds(130, 8), (128, 136));
    }

    #[test]
    fn test_recent_positions_wrap() {
        assert!(is_recent(5, 0));
        assert!(is_recent(10, 4));
        assert!(!is_recent(4, 4));
        assert!(!is_recent(3, 4));
        // Head wrapped past zero, limit still near the top
        assert!(is_recent(2, u32::MAX - 3));
    }

    #[test]
    fn test_random_area_clipped_to_tablespace() {
        let (pool, io) = pool(config(true, false), 20);
        get(&pool, 16);
        assert_eq!(io.submitted_count(), 0);
        // Checked before the miss is read, so page 17 comes in with the area
        get(&pool, 17);
        let expected: Vec<PageId> = [17, 18, 19].iter().map(|&no| PageId::new(1, no)).collect();
        assert_eq!(io.submitted(), expected);
        assert!(!pool.is_cached(PageId::new(1, 20)));
        pool.validate().unwrap();
    }

    #[test]
    fn test_ordered_pages_never_trigger_or_get_read() {
        let (pool, io) = pool(config(true, true), 64);
        get(&pool, 0);
        assert_eq!(pool.read_ahead().random(PageId::new(1, 1)).unwrap(), 0);
        assert_eq!(pool.read_ahead().linear(PageId::new(1, 1)).unwrap(), 0);
        assert!(!io.submitted().contains(&PageId::new(1, 1)));
    }

    #[test]
    fn test_random_refused_while_reads_pending() {
        let config = config(true, false);
        let store = Arc::new(MemStore::new(config.page_size));
        store.create_space(SpaceId(1), 64);
        let io = Arc::new(StalledIo {
            store: store.clone(),
            queued: Mutex::new(Vec::new()),
        });
        let pool = BufferPool::builder(config, store)
            .io(io.clone())
            .build()
            .unwrap();

        get(&pool, 16);
        // Limit is capacity / 2 = 16 pending reads
        for no in 32..49 {
            assert!(pool.read_page_async(PageId::new(1, no)).unwrap());
        }
        assert_eq!(io.pending_reads(), 17);
        assert_eq!(pool.read_ahead().random(PageId::new(1, 17)).unwrap(), 0);

        io.complete_all();
        assert_eq!(io.pending_reads(), 0);
        assert!(pool.is_cached(PageId::new(1, 40)));
        assert_eq!(pool.read_ahead().random(PageId::new(1, 17)).unwrap(), 7);
        io.complete_all();
        pool.validate().unwrap();
    }

    #[test]
    fn test_linear_only_from_area_boundaries() {
        let (pool, io) = pool(config(false, true), 64);
        for no in 0..7 {
            get(&pool, no);
        }
        assert_eq!(pool.read_ahead().linear(PageId::new(1, 3)).unwrap(), 0);
        assert_eq!(io.submitted_count(), 0);

        get(&pool, 7);
        assert_eq!(io.submitted_count(), 8);
        // The next area is cached now: nothing more to read
        assert_eq!(pool.read_ahead().linear(PageId::new(1, 7)).unwrap(), 0);
    }

    #[test]
    fn test_linear_descending_scan_reads_previous_area() {
        let (pool, io) = pool(config(false, true), 64);
        for no in (8..16).rev() {
            get(&pool, no);
        }
        // Page 1 of the previous area is an ordered page and is skipped
        let expected: Vec<PageId> = [0, 2, 3, 4, 5, 6, 7]
            .iter()
            .map(|&no| PageId::new(1, no))
            .collect();
        assert_eq!(io.submitted(), expected);
        assert_eq!(pool.metrics().snapshot().read_ahead_linear, 7);
    }

    #[test]
    fn test_linear_out_of_order_access_not_triggered() {
        let (pool, io) = pool(config(false, true), 64);
        for no in [3, 2, 1, 0, 4, 5, 6, 7] {
            get(&pool, no);
        }
        assert_eq!(io.submitted_count(), 0);
    }
}
