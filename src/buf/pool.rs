//! The buffer pool
//!
//! A fixed arena of [`BufBlock`] slots, the LRU state (list, free list and
//! slot metadata) under one [`WaitMutex`], the buddy allocator under a
//! second one, and the page directory mapping page ids to slots.
//!
//! # Page lifecycle
//!
//! ```text
//!           pop_free            install (io_fix = Read)          read done
//!  NotUsed ─────────▶ ReadyForUse ─────────────────────▶ FilePage ─────────▶ FilePage
//!     ▲                  │  lend_slot                        │                (io_fix None)
//!     │                  ▼                                   │ evict / drop tablespace
//!     │               Memory ── reclaim_slot ──┐             ▼
//!     └────────────────────────────────────────┴──────── RemoveHash
//! ```
//!
//! Directory inserts and removals happen only under the LRU state lock, so a
//! directory hit observed while holding it is stable until the lock is
//! released.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::buf::block::{BufBlock, IoFix, SlotId, SlotState, ZipRef};
use crate::buf::buddy::{BuddySizes, BuddyState, BuddyStats, SlotSource};
use crate::buf::flush::{Flusher, LruTailFlusher};
use crate::buf::lru::LruState;
use crate::buf::metrics::{MetricsSnapshot, PoolMetrics};
use crate::buf::zip::PageCompressor;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::page::{self, header, page_type, PageId, SpaceId};
use crate::storage::{
    AsyncIo, PageDirectory, PageStore, ReadCompletion, ReadRequest, ShardedDirectory, ThreadedIo,
};
use crate::sync::{ObjectId, WaitArray, WaitKind, WaitMutex, WaitStats, Watchdog};

/// Crash recovery progress, as far as the pool cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecoveryPhase {
    /// Regular operation
    #[default]
    Normal = 0,
    /// Earliest phase: read-ahead is refused
    Startup = 1,
    /// Log apply: the exhaustion guard is relaxed
    Recovery = 2,
}

impl RecoveryPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RecoveryPhase::Startup,
            2 => RecoveryPhase::Recovery,
            _ => RecoveryPhase::Normal,
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub captured_at: DateTime<Utc>,
    pub capacity: usize,
    pub page_size: usize,
    pub free: usize,
    pub lru_len: usize,
    pub lru_old_len: usize,
    pub memory_slots: usize,
    pub dirty: usize,
    pub pinned: usize,
    pub pending_reads: usize,
    pub directory_entries: usize,
    pub recovery_phase: RecoveryPhase,
    pub shrinking: bool,
    pub hit_ratio: f64,
    pub metrics: MetricsSnapshot,
    pub buddy: BuddyStats,
    pub wait: WaitStats,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`BufferPool`] with optional collaborator overrides
pub struct PoolBuilder {
    config: PoolConfig,
    store: Arc<dyn PageStore>,
    io: Option<Arc<dyn AsyncIo>>,
    flusher: Option<Arc<dyn Flusher>>,
    directory: Option<Arc<dyn PageDirectory>>,
    wait_array: Option<Arc<WaitArray>>,
}

impl PoolBuilder {
    pub fn io(mut self, io: Arc<dyn AsyncIo>) -> Self {
        self.io = Some(io);
        self
    }

    pub fn flusher(mut self, flusher: Arc<dyn Flusher>) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PageDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn wait_array(mut self, array: Arc<WaitArray>) -> Self {
        self.wait_array = Some(array);
        self
    }

    pub fn build(self) -> Result<Arc<BufferPool>> {
        let config = self.config;
        config.validate()?;
        if self.store.page_size() != config.page_size {
            return Err(Error::Config(format!(
                "store page size {} does not match pool page size {}",
                self.store.page_size(),
                config.page_size
            )));
        }

        let sync = match self.wait_array {
            Some(array) => array,
            None => Arc::new(WaitArray::from_config(&config.sync, config.fatal_policy)),
        };
        let io = match self.io {
            Some(io) => io,
            None => Arc::new(ThreadedIo::new(self.store.clone(), config.io_threads)?),
        };
        let flusher = self.flusher.unwrap_or_else(|| Arc::new(LruTailFlusher));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(ShardedDirectory::new(config.directory_shards)));
        let metrics = PoolMetrics::new()?;

        let capacity = config.capacity;
        let blocks = (0..capacity as u32)
            .map(|i| BufBlock::new(SlotId(i), config.page_size))
            .collect();
        let spin = config.sync.spin_rounds;
        let lru_state = WaitMutex::new(
            LruState::new(capacity, &config.lru),
            "buf_pool_lru",
            sync.clone(),
            spin,
        );
        let buddy_state = WaitMutex::new(
            BuddyState::from_config(&config),
            "buf_pool_zip",
            sync.clone(),
            spin,
        );
        let io_objects = sync.new_objects("page_io", capacity);
        let buddy_sizes = BuddySizes::from_config(&config);

        info!(
            capacity,
            page_size = config.page_size,
            shards = config.directory_shards,
            "buffer pool created"
        );

        Ok(Arc::new_cyclic(|weak| BufferPool {
            config,
            blocks,
            lru_state,
            buddy_state,
            buddy_sizes,
            directory,
            store: self.store,
            io,
            flusher,
            sync,
            io_objects,
            metrics,
            compressor: PageCompressor::new(),
            recovery: AtomicU8::new(RecoveryPhase::Normal as u8),
            shrinking: AtomicBool::new(false),
            access_seq: AtomicU64::new(0),
            mod_clock: AtomicU64::new(0),
            started: Instant::now(),
            weak_self: weak.clone(),
        }))
    }
}

// =============================================================================
// Buffer Pool
// =============================================================================

/// Fixed-capacity page cache
pub struct BufferPool {
    pub(crate) config: PoolConfig,
    pub(crate) blocks: Box<[BufBlock]>,
    pub(crate) lru_state: WaitMutex<LruState>,
    pub(crate) buddy_state: WaitMutex<BuddyState>,
    pub(crate) buddy_sizes: BuddySizes,
    pub(crate) directory: Arc<dyn PageDirectory>,
    store: Arc<dyn PageStore>,
    io: Arc<dyn AsyncIo>,
    flusher: Arc<dyn Flusher>,
    sync: Arc<WaitArray>,
    /// First of `capacity` per-slot page I/O objects
    io_objects: ObjectId,
    pub(crate) metrics: PoolMetrics,
    compressor: PageCompressor,
    recovery: AtomicU8,
    shrinking: AtomicBool,
    access_seq: AtomicU64,
    mod_clock: AtomicU64,
    started: Instant,
    weak_self: Weak<BufferPool>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.config.capacity)
            .field("page_size", &self.config.page_size)
            .field("directory_entries", &self.directory.len())
            .finish()
    }
}

impl BufferPool {
    /// Pool with the default collaborators: threaded I/O over `store`,
    /// a sharded directory and the LRU tail flusher
    pub fn new(config: PoolConfig, store: Arc<dyn PageStore>) -> Result<Arc<Self>> {
        Self::builder(config, store).build()
    }

    pub fn builder(config: PoolConfig, store: Arc<dyn PageStore>) -> PoolBuilder {
        PoolBuilder {
            config,
            store,
            io: None,
            flusher: None,
            directory: None,
            wait_array: None,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn block(&self, slot: SlotId) -> &BufBlock {
        &self.blocks[slot.index()]
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    pub fn io(&self) -> &Arc<dyn AsyncIo> {
        &self.io
    }

    pub fn wait_array(&self) -> &Arc<WaitArray> {
        &self.sync
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn compressor(&self) -> PageCompressor {
        self.compressor
    }

    /// Slot caching `page`, without pinning it
    pub fn peek(&self, page: PageId) -> Option<SlotId> {
        self.directory.lookup(page)
    }

    pub fn is_cached(&self, page: PageId) -> bool {
        self.peek(page).is_some()
    }

    /// Wait array object signalled when a read into `slot` finishes
    pub fn io_object(&self, slot: SlotId) -> ObjectId {
        self.io_objects.offset(slot.index())
    }

    pub fn recovery_phase(&self) -> RecoveryPhase {
        RecoveryPhase::from_u8(self.recovery.load(Ordering::SeqCst))
    }

    pub fn set_recovery_phase(&self, phase: RecoveryPhase) {
        let prev = self.recovery.swap(phase as u8, Ordering::SeqCst);
        if prev != phase as u8 {
            info!(?phase, "recovery phase changed");
        }
    }

    pub fn is_shrinking(&self) -> bool {
        self.shrinking.load(Ordering::SeqCst)
    }

    /// While shrinking, freed buddy blocks always coalesce
    pub fn set_shrinking(&self, shrinking: bool) {
        self.shrinking.store(shrinking, Ordering::SeqCst);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn next_access_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_mod_stamp(&self) -> u64 {
        self.mod_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    // =========================================================================
    // Free slots
    // =========================================================================

    /// Guard against the pool filling with non-replaceable memory.
    ///
    /// Fatal once free plus LRU slots drop below `capacity /
    /// exhaustion_divisor` outside recovery; a warning is logged once when
    /// they drop below `capacity / warning_divisor`.
    fn check_occupancy(&self, state: &mut LruState) -> Result<()> {
        let ev = &self.config.eviction;
        let capacity = self.capacity();
        let available = state.free_len() + state.lru.len();

        if available < capacity / ev.exhaustion_divisor {
            if self.recovery_phase() != RecoveryPhase::Normal {
                return Ok(());
            }
            let err = Error::PoolExhausted {
                free: state.free_len(),
                lru: state.lru.len(),
                capacity,
                divisor: ev.exhaustion_divisor,
            };
            return Err(self
                .config
                .fatal_policy
                .escalate(err, || self.describe_state(state)));
        }

        if available < capacity / ev.warning_divisor {
            if !state.low_memory_warned {
                state.low_memory_warned = true;
                warn!(
                    free = state.free_len(),
                    lru = state.lru.len(),
                    capacity,
                    "over two thirds of the buffer pool is occupied by non-page memory"
                );
            }
        } else {
            state.low_memory_warned = false;
        }
        Ok(())
    }

    /// Take a free slot, evicting from the LRU tail and asking the flusher
    /// for write-back until one is found.
    ///
    /// Sleeps between rounds with no locks held. Only resource exhaustion
    /// ends the loop with an error.
    pub fn acquire_free_slot(&self) -> Result<SlotId> {
        let ev = &self.config.eviction;
        let mut attempt: u32 = 1;
        let mut diagnosed = false;

        loop {
            let (free, lru_len) = {
                let mut state = self.lru_state.lock()?;
                self.check_occupancy(&mut state)?;
                if let Some(slot) = state.pop_free() {
                    return Ok(slot);
                }
                if self.evict_from_tail(&mut state, attempt)? {
                    continue;
                }
                (state.free_len(), state.lru.len())
            };

            if attempt > ev.diagnostics_after && !diagnosed {
                diagnosed = true;
                warn!(
                    attempts = attempt,
                    free,
                    lru = lru_len,
                    pending_reads = self.io.pending_reads(),
                    capacity = self.capacity(),
                    "difficult to find free slots; consider a larger pool"
                );
            }

            self.metrics.free_slot_waits.inc();
            self.metrics.flush_requests.inc();
            self.flusher.request_writeback(self, ev.flush_batch);
            thread::sleep(ev.backoff(attempt));
            attempt += 1;
        }
    }

    /// One round of [`acquire_free_slot`](Self::acquire_free_slot) without
    /// waiting
    pub fn try_acquire_free_slot(&self) -> Result<Option<SlotId>> {
        let mut state = self.lru_state.lock()?;
        self.check_occupancy(&mut state)?;
        if let Some(slot) = state.pop_free() {
            return Ok(Some(slot));
        }
        if self.evict_from_tail(&mut state, 1)? {
            return Ok(state.pop_free());
        }
        Ok(None)
    }

    /// Pop the free list only
    pub(crate) fn pop_free_slot(&self) -> Result<Option<SlotId>> {
        Ok(self.lru_state.lock()?.pop_free())
    }

    /// Scan from the tail for a replaceable page and free it. The scan is
    /// bounded for the first attempts and covers the whole list after.
    fn evict_from_tail(&self, state: &mut LruState, attempt: u32) -> Result<bool> {
        let ev = &self.config.eviction;
        let bounded = attempt <= ev.bounded_scan_attempts;
        let limit = ev.scan_base + attempt as usize * self.capacity() / ev.scan_divisor;

        let mut distance = 0;
        let mut cursor = state.lru.tail();
        while let Some(slot) = cursor {
            if bounded && distance >= limit {
                break;
            }
            cursor = state.lru.prev(slot);
            if self.flusher.is_replaceable(self.block(slot)) {
                let page = state.page_of(slot);
                self.free_file_page(state, slot)?;
                self.metrics.evictions.inc();
                trace!(%slot, ?page, distance, "evicted from LRU tail");
                return Ok(true);
            }
            distance += 1;
        }
        Ok(false)
    }

    /// Remove a file page from the directory and the LRU list, release its
    /// compressed image and put the slot on the free list
    fn free_file_page(&self, state: &mut LruState, slot: SlotId) -> Result<()> {
        let Some(page) = state.page_of(slot) else {
            let err = Error::invariant("lru", format!("{} on the LRU list without a page", slot));
            return Err(self
                .config
                .fatal_policy
                .escalate(err, || self.describe_state(state)));
        };
        state.meta[slot.index()].state = SlotState::RemoveHash;
        self.directory.remove(page);
        state.lru.remove(slot);

        let zip = self.block(slot).zip.lock().take();
        if let Some(z) = zip {
            if let Some(host) = self.buddy().release(z.into(), z.class as usize)? {
                self.block(host).reset();
                state.push_free(host);
            }
        }

        self.block(slot).reset();
        state.push_free(slot);
        Ok(())
    }

    /// Mark a `ReadyForUse` slot as lent memory
    pub(crate) fn lend_slot(&self, slot: SlotId) -> Result<()> {
        let mut state = self.lru_state.lock()?;
        if state.state_of(slot) != SlotState::ReadyForUse {
            let err = Error::invariant(
                "lru",
                format!("lending {} in state {:?}", slot, state.state_of(slot)),
            );
            return Err(self
                .config
                .fatal_policy
                .escalate(err, || self.describe_state(&state)));
        }
        state.meta[slot.index()].state = SlotState::Memory;
        Ok(())
    }

    /// Return a lent slot to the free list
    pub(crate) fn reclaim_slot(&self, slot: SlotId) -> Result<()> {
        let mut state = self.lru_state.lock()?;
        if state.state_of(slot) != SlotState::Memory {
            let err = Error::invariant(
                "lru",
                format!("reclaiming {} in state {:?}", slot, state.state_of(slot)),
            );
            return Err(self
                .config
                .fatal_policy
                .escalate(err, || self.describe_state(&state)));
        }
        self.block(slot).reset();
        state.push_free(slot);
        Ok(())
    }

    /// A whole slot lent out as raw memory; it is not replaceable until
    /// freed with [`free_memory_block`](Self::free_memory_block)
    pub fn alloc_memory_block(&self) -> Result<MemoryBlock> {
        let slot = self.acquire_free_slot()?;
        self.lend_slot(slot)?;
        Ok(MemoryBlock { slot })
    }

    pub fn free_memory_block(&self, block: MemoryBlock) -> Result<()> {
        self.reclaim_slot(block.slot)
    }

    /// Run `f` over the memory of a lent block
    pub fn with_memory_block<R>(&self, block: &MemoryBlock, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut frame = self.block(block.slot).frame.write();
        f(&mut frame)
    }

    // =========================================================================
    // Page access
    // =========================================================================

    /// Pin `page`, reading it if it is not cached.
    ///
    /// A hit on an old page moves it to the head once the page was first
    /// accessed at least `old_block_time` ago; a hit on a young page moves it
    /// once it drifted more than a quarter of the young segment from the
    /// head. The first access may trigger linear read-ahead.
    pub fn get_page(&self, page: PageId) -> Result<PinnedPage<'_>> {
        let mut hit = true;
        let (slot, first_access) = loop {
            let state = self.lru_state.lock()?;
            let Some(slot) = self.directory.lookup(page) else {
                drop(state);
                hit = false;
                self.read_page_sync(page)?;
                continue;
            };

            let block = self.block(slot);
            if block.io_fix() == IoFix::Read {
                drop(state);
                self.wait_for_read(slot)?;
                continue;
            }
            block.pin();
            let first = block.mark_accessed(self.next_access_seq(), self.now_ms());
            let mut state = state;
            if !first {
                self.touch(&mut state, slot);
            }
            break (slot, first);
        };

        if hit {
            self.metrics.page_hits.inc();
        } else {
            self.metrics.page_misses.inc();
        }
        let pinned = PinnedPage {
            pool: self,
            slot,
            page,
        };
        if first_access && self.config.read_ahead.linear_enabled {
            self.read_ahead().linear(page)?;
        }
        Ok(pinned)
    }

    /// Make a re-accessed page young if its age or drift says so
    fn touch(&self, state: &mut LruState, slot: SlotId) {
        let block = self.block(slot);
        let promote = if state.lru.is_old(slot) {
            let age = self.now_ms().saturating_sub(block.first_access_ms());
            age >= self.config.lru.old_block_time_ms
        } else if state.lru.old_marker().is_some() {
            let young_quarter = (state.lru.len() * 5 / 32) as u32;
            state.lru.distance_from_head(slot) > young_quarter
        } else {
            false
        };
        if promote {
            state.lru.make_young(slot);
            self.metrics.made_young.inc();
        }
    }

    /// Block until the in-flight read into `slot` finishes
    fn wait_for_read(&self, slot: SlotId) -> Result<()> {
        let block = self.block(slot);
        self.sync
            .wait_until(self.io_object(slot), WaitKind::PageIo, || {
                block.io_fix() != IoFix::Read
            })
    }

    /// Put `page` into `slot`: directory, LRU (old segment) and metadata
    fn install(&self, state: &mut LruState, slot: SlotId, page: PageId, fix: IoFix) {
        let block = self.block(slot);
        block.reset();
        block.set_io_fix(fix);
        let meta = &mut state.meta[slot.index()];
        meta.state = SlotState::FilePage;
        meta.page = Some(page);
        self.directory.insert(page, slot);
        state.lru.add(slot, true);
    }

    /// Undo [`install`](Self::install) after a failed read
    fn discard(&self, state: &mut LruState, slot: SlotId, page: PageId) {
        self.directory.remove(page);
        state.lru.remove(slot);
        self.block(slot).reset();
        state.push_free(slot);
    }

    /// Demand read of `page` on the calling thread
    fn read_page_sync(&self, page: PageId) -> Result<()> {
        if self.config.read_ahead.random_enabled {
            self.read_ahead().random(page)?;
        }

        let slot = self.acquire_free_slot()?;
        {
            let mut state = self.lru_state.lock()?;
            if self.directory.lookup(page).is_some() {
                state.push_free(slot);
                return Ok(());
            }
            self.install(&mut state, slot, page, IoFix::Read);
        }

        let outcome = {
            let mut frame = self.block(slot).frame.write();
            self.store.read_page(page, &mut frame)
        };
        self.finish_read(slot, page, outcome)
    }

    /// Submit an asynchronous read of `page` unless it is cached or no slot
    /// is free right now. Returns whether a read was submitted.
    pub fn read_page_async(&self, page: PageId) -> Result<bool> {
        if self.directory.lookup(page).is_some() {
            return Ok(false);
        }
        let Some(slot) = self.try_acquire_free_slot()? else {
            return Ok(false);
        };
        {
            let mut state = self.lru_state.lock()?;
            if self.directory.lookup(page).is_some() {
                state.push_free(slot);
                return Ok(false);
            }
            self.install(&mut state, slot, page, IoFix::Read);
        }

        let weak = self.weak_self.clone();
        let completion: ReadCompletion = Box::new(move |result| {
            if let Some(pool) = weak.upgrade() {
                pool.complete_async_read(slot, page, result);
            }
        });
        let request = ReadRequest {
            page,
            len: self.page_size(),
        };
        if let Err(e) = self.io.submit_read(request, completion) {
            warn!(%page, error = %e, "read submission failed");
            if let Err(e) = self.finish_read(slot, page, Err(e)) {
                if e.is_fatal() {
                    return Err(e);
                }
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn complete_async_read(&self, slot: SlotId, page: PageId, result: Result<Vec<u8>>) {
        let outcome = result.and_then(|data| {
            let mut frame = self.block(slot).frame.write();
            if data.len() != frame.len() {
                return Err(Error::PageSizeMismatch {
                    page,
                    expected: frame.len(),
                    actual: data.len(),
                });
            }
            frame.copy_from_slice(&data);
            Ok(())
        });
        match self.finish_read(slot, page, outcome) {
            Ok(()) => trace!(%page, %slot, "asynchronous read complete"),
            Err(e) if e.is_fatal() => error!(%page, error = %e, "asynchronous read completion failed"),
            Err(e) => warn!(%page, error = %e, "asynchronous read failed; page dropped"),
        }
    }

    /// Clear the read io-fix (or discard the slot on failure) and wake the
    /// threads waiting for the read
    fn finish_read(&self, slot: SlotId, page: PageId, outcome: Result<()>) -> Result<()> {
        let result = match outcome {
            Ok(()) => {
                self.block(slot).set_io_fix(IoFix::None);
                self.metrics.pages_read.inc();
                Ok(())
            }
            Err(e) => {
                self.metrics.read_errors.inc();
                match self.lru_state.lock() {
                    Ok(mut state) => {
                        self.discard(&mut state, slot, page);
                        Err(e)
                    }
                    Err(lock_err) => Err(lock_err),
                }
            }
        };
        self.sync.signal(self.io_object(slot));
        result
    }

    /// Create `page` without reading it: the frame is zeroed and gets a
    /// fresh header. Returns the cached page if it already exists.
    pub fn create_page(&self, page: PageId) -> Result<PinnedPage<'_>> {
        if self.is_cached(page) {
            return self.get_page(page);
        }
        let slot = self.acquire_free_slot()?;
        {
            let mut frame = self.block(slot).frame.write();
            frame.fill(0);
            page::init_header(&mut frame, page, None, None, page_type::ALLOCATED);
        }

        {
            let mut state = self.lru_state.lock()?;
            if self.directory.lookup(page).is_some() {
                state.push_free(slot);
                drop(state);
                return self.get_page(page);
            }
            self.install(&mut state, slot, page, IoFix::None);
            let block = self.block(slot);
            block.pin();
            block.mark_accessed(self.next_access_seq(), self.now_ms());
        }
        self.block(slot).mark_dirty(self.next_mod_stamp());
        self.metrics.pages_created.inc();
        debug!(%page, %slot, "page created");
        Ok(PinnedPage {
            pool: self,
            slot,
            page,
        })
    }

    // =========================================================================
    // Tablespaces and write-back
    // =========================================================================

    /// Drop every cached page of `space`, discarding unwritten changes.
    ///
    /// Pages that are pinned or have I/O in flight are waited for: the scan
    /// is repeated after a short pause until none remain. Returns the number
    /// of slots freed.
    pub fn evict_tablespace(&self, space: SpaceId) -> Result<usize> {
        let mut freed = 0usize;
        let mut rounds = 0u32;
        loop {
            let busy = {
                let mut state = self.lru_state.lock()?;
                let slots: Vec<SlotId> = state
                    .lru
                    .iter_from_tail()
                    .filter(|s| state.page_of(*s).map(|p| p.space) == Some(space))
                    .collect();
                let mut busy = 0;
                for slot in slots {
                    let block = self.block(slot);
                    if block.is_pinned() || block.io_fix() != IoFix::None {
                        busy += 1;
                        continue;
                    }
                    if block.is_dirty() {
                        trace!(%slot, "discarding dirty page of dropped tablespace");
                    }
                    self.free_file_page(&mut state, slot)?;
                    freed += 1;
                }
                busy
            };
            if busy == 0 {
                break;
            }
            rounds += 1;
            debug!(%space, busy, rounds, "tablespace pages still in use, retrying");
            thread::sleep(self.config.eviction.tablespace_retry());
        }
        self.metrics.tablespace_evictions.inc_by(freed as u64);
        info!(%space, freed, "tablespace evicted from the buffer pool");
        Ok(freed)
    }

    /// Mark up to `max` dirty pages from the tail for write-back
    fn claim_dirty(&self, max: usize, skip_pinned: bool) -> Result<Vec<(SlotId, PageId)>> {
        let state = self.lru_state.lock()?;
        let mut batch = Vec::new();
        for slot in state.lru.iter_from_tail() {
            if batch.len() >= max {
                break;
            }
            let block = self.block(slot);
            if !block.is_dirty() || block.io_fix() != IoFix::None {
                continue;
            }
            if skip_pinned && block.is_pinned() {
                continue;
            }
            let Some(page) = state.page_of(slot) else {
                continue;
            };
            block.set_io_fix(IoFix::Write);
            batch.push((slot, page));
        }
        Ok(batch)
    }

    fn write_back(&self, slot: SlotId, page: PageId) -> bool {
        let block = self.block(slot);
        let (image, seen) = {
            let frame = block.frame.read();
            (frame.to_vec(), block.last_modified())
        };
        let written = match self.store.write_page(page, &image) {
            Ok(()) => {
                block.mark_clean_if_unchanged(seen);
                self.metrics.pages_written.inc();
                true
            }
            Err(e) => {
                error!(%page, error = %e, "page write-back failed");
                false
            }
        };
        block.set_io_fix(IoFix::None);
        written
    }

    /// Write up to `max` unpinned dirty pages nearest the LRU tail
    pub fn flush_lru_tail(&self, max: usize) -> Result<usize> {
        let batch = self.claim_dirty(max, true)?;
        Ok(batch
            .into_iter()
            .filter(|(slot, page)| self.write_back(*slot, *page))
            .count())
    }

    /// Write every dirty page, pinned ones included
    pub fn flush_all(&self) -> Result<usize> {
        let batch = self.claim_dirty(usize::MAX, false)?;
        let written = batch
            .into_iter()
            .filter(|(slot, page)| self.write_back(*slot, *page))
            .count();
        debug!(written, "flushed all dirty pages");
        Ok(written)
    }

    // =========================================================================
    // Compressed images
    // =========================================================================

    /// Store `image` in a buddy block and attach it to the page in `slot`,
    /// replacing any previous image. The image must start with the page
    /// header, which identifies the owner during relocation.
    fn attach_zip(&self, slot: SlotId, image: &[u8]) -> Result<ZipRef> {
        let sizes = self.buddy_sizes;
        let too_big = || Error::InvalidBlockSize {
            size: image.len(),
            min: header::LEN,
            max: sizes.size(sizes.full_class()),
        };
        if image.len() < header::LEN {
            return Err(too_big());
        }
        let class = sizes.class_for(image.len()).ok_or_else(too_big)?;

        let buddy = self.buddy();
        let addr = buddy
            .alloc(class, SlotSource::Evict)?
            .ok_or(Error::NoFreeSlot { attempts: 1 })?;
        {
            let mut frame = self.block(addr.slot).frame.write();
            let start = addr.offset as usize;
            frame[start..start + image.len()].copy_from_slice(image);
        }

        let zref = ZipRef {
            slot: addr.slot,
            offset: addr.offset,
            class: class as u8,
            len: image.len() as u32,
        };
        let old = self.block(slot).zip.lock().replace(zref);
        if let Some(old) = old {
            buddy.free(old.into(), old.class as usize)?;
        }
        Ok(zref)
    }

    fn zip_image(&self, slot: SlotId) -> Option<Bytes> {
        let zip = self.block(slot).zip.lock();
        let z = (*zip)?;
        let frame = self.block(z.slot).frame.read();
        let start = z.offset as usize;
        Some(Bytes::copy_from_slice(&frame[start..start + z.len as usize]))
    }

    fn drop_zip(&self, slot: SlotId) -> Result<bool> {
        let old = self.block(slot).zip.lock().take();
        match old {
            Some(z) => {
                self.buddy().free(z.into(), z.class as usize)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Validation and diagnostics
    // =========================================================================

    /// Check the LRU state, directory agreement, buddy state and wait array.
    /// A violation is escalated through the fatal policy.
    pub fn validate(&self) -> Result<()> {
        {
            let state = self.lru_state.lock()?;
            let check = state.validate().and_then(|_| self.check_directory(&state));
            if let Err(detail) = check {
                let err = Error::invariant("lru", detail);
                return Err(self
                    .config
                    .fatal_policy
                    .escalate(err, || self.describe_state(&state)));
            }
        }
        self.buddy().validate()?;
        self.sync.validate()
    }

    fn check_directory(&self, state: &LruState) -> std::result::Result<(), String> {
        for slot in state.lru.iter() {
            let page = state
                .page_of(slot)
                .ok_or_else(|| format!("{} on the LRU list without a page", slot))?;
            match self.directory.lookup(page) {
                Some(s) if s == slot => {}
                other => {
                    return Err(format!(
                        "{} caches {} but the directory maps it to {:?}",
                        slot, page, other
                    ))
                }
            }
        }
        if self.directory.len() != state.lru.len() {
            return Err(format!(
                "directory has {} entries, LRU list {}",
                self.directory.len(),
                state.lru.len()
            ));
        }
        Ok(())
    }

    fn describe_state(&self, state: &LruState) -> String {
        format!(
            "buffer pool: capacity {}, free {}, LRU {} (old {}), memory {}, pending reads {}, \
             recovery {:?}\n{}",
            self.capacity(),
            state.free_len(),
            state.lru.len(),
            state.lru.old_len(),
            state.count_in_state(SlotState::Memory),
            self.io.pending_reads(),
            self.recovery_phase(),
            self.sync.diagnostics()
        )
    }

    /// Human-readable dump of the pool and the wait array
    pub fn diagnostics(&self) -> Result<String> {
        let state = self.lru_state.lock()?;
        Ok(self.describe_state(&state))
    }

    /// Snapshot of occupancy and counters; also refreshes the gauges
    pub fn stats(&self) -> Result<PoolStats> {
        let (free, lru_len, lru_old_len, memory_slots, dirty, pinned) = {
            let state = self.lru_state.lock()?;
            let dirty = state.lru.iter().filter(|s| self.block(*s).is_dirty()).count();
            let pinned = self.blocks.iter().filter(|b| b.is_pinned()).count();
            (
                state.free_len(),
                state.lru.len(),
                state.lru.old_len(),
                state.count_in_state(SlotState::Memory),
                dirty,
                pinned,
            )
        };
        let wait = self.sync.stats();
        let pending_reads = self.io.pending_reads();

        self.metrics.free_slots.set(free as i64);
        self.metrics.lru_len.set(lru_len as i64);
        self.metrics.lru_old_len.set(lru_old_len as i64);
        self.metrics.pending_reads.set(pending_reads as i64);
        self.metrics.wait_reserved.set(wait.reserved as i64);

        Ok(PoolStats {
            captured_at: Utc::now(),
            capacity: self.capacity(),
            page_size: self.page_size(),
            free,
            lru_len,
            lru_old_len,
            memory_slots,
            dirty,
            pinned,
            pending_reads,
            directory_entries: self.directory.len(),
            recovery_phase: self.recovery_phase(),
            shrinking: self.is_shrinking(),
            hit_ratio: self.metrics.hit_ratio(),
            metrics: self.metrics.snapshot(),
            buddy: self.buddy().stats()?,
            wait,
        })
    }

    /// Start the long-wait watchdog over this pool's wait array
    pub fn spawn_watchdog(&self) -> Result<Watchdog> {
        Watchdog::spawn(self.sync.clone(), self.config.sync.sweep_interval())
    }
}

// =============================================================================
// Handles
// =============================================================================

/// A slot lent out as raw memory
#[derive(Debug)]
pub struct MemoryBlock {
    slot: SlotId,
}

impl MemoryBlock {
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

/// A pinned page; unpinned on drop
pub struct PinnedPage<'a> {
    pool: &'a BufferPool,
    slot: SlotId,
    page: PageId,
}

impl<'a> PinnedPage<'a> {
    pub fn page_id(&self) -> PageId {
        self.page
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn block(&self) -> &'a BufBlock {
        self.pool.block(self.slot)
    }

    pub fn read(&self) -> PageReadGuard<'a> {
        PageReadGuard {
            guard: self.block().frame.read(),
        }
    }

    pub fn try_read(&self) -> Option<PageReadGuard<'a>> {
        self.block()
            .frame
            .try_read()
            .map(|guard| PageReadGuard { guard })
    }

    /// Exclusive access to the frame; the page is marked dirty when the
    /// guard is dropped
    pub fn write(&self) -> PageWriteGuard<'a> {
        PageWriteGuard {
            guard: self.block().frame.write(),
            block: self.block(),
            pool: self.pool,
        }
    }

    /// Compress the current frame and attach the image
    pub fn compress(&self) -> Result<ZipRef> {
        let image = {
            let frame = self.block().frame.read();
            self.pool.compressor.compress(&frame)?
        };
        self.pool.attach_zip(self.slot, &image)
    }

    /// Attach an already built image
    pub fn attach_zip(&self, image: &[u8]) -> Result<ZipRef> {
        self.pool.attach_zip(self.slot, image)
    }

    /// Copy of the attached image
    pub fn zip_image(&self) -> Option<Bytes> {
        self.pool.zip_image(self.slot)
    }

    /// Release the attached image; `false` if there was none
    pub fn drop_zip(&self) -> Result<bool> {
        self.pool.drop_zip(self.slot)
    }

    /// Rebuild the frame from the attached image; `false` if there is none
    pub fn restore_from_zip(&self) -> Result<bool> {
        let Some(image) = self.zip_image() else {
            return Ok(false);
        };
        let data = self.pool.compressor.decompress(&image, self.pool.page_size())?;
        self.write().copy_from_slice(&data);
        Ok(true)
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pool.block(self.slot).unpin();
    }
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page", &self.page)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Shared frame latch
pub struct PageReadGuard<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl std::ops::Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive frame latch
pub struct PageWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
    block: &'a BufBlock,
    pool: &'a BufferPool,
}

impl std::ops::Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.block.mark_dirty(self.pool.next_mod_stamp());
    }
}

// =============================================================================
// Tests
// =============================================================================
