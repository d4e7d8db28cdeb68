//! Wait Array
//!
//! A fixed table of wait cells through which threads block on a
//! synchronization object (a mutex, an in-flight page read) until another
//! thread signals that object.
//!
//! # Cell lifecycle
//!
//! ```text
//!            reserve()                 signal(object)
//!   ┌──────┐ ─────────▶ ┌──────────┐ ────────────────▶ ┌───────────┐
//!   │ Free │            │ Reserved │                   │ WakingUp  │
//!   └──────┘ ◀───────── └──────────┘                   └───────────┘
//!      ▲      free()         │ wait()                        │
//!      │    (cancel)         ▼                               │
//!      │              block on the cell's event ─────────────┤
//!      └──────────────────────── free() ◀────────────────────┘
//! ```
//!
//! # Lost wakeups
//!
//! `reserve` resets the cell's [`Event`] and snapshots its signal count. A
//! waiter re-checks its condition *after* reserving; a `signal` that lands
//! between the re-check and `wait` has already moved the cell to `WakingUp`
//! and set the event, so `wait` returns at once.
//!
//! # Deadlock detection
//!
//! When enabled, `wait` walks waiter → object → holder → the holder's waiting
//! cell → ... under the array lock. Reaching the starting thread again is a
//! deadlock; the chain is logged and the error escalated through the
//! configured [`FatalPolicy`].

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use super::event::Event;
use crate::config::SyncConfig;
use crate::error::{Error, FatalPolicy, Result};

// =============================================================================
// Identities
// =============================================================================

/// Identifier of a synchronization object that threads can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The `index`-th object of a range allocated with [`WaitArray::new_objects`]
    pub fn offset(self, index: usize) -> ObjectId {
        ObjectId(self.0 + index as u64)
    }
}

/// Process-unique thread identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadKey(pub u64);

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_KEY: ThreadKey = ThreadKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed));
}

impl ThreadKey {
    /// Key of the calling thread
    pub fn current() -> ThreadKey {
        THREAD_KEY.with(|k| *k)
    }
}

/// Kind of access a waiter wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Exclusive lock
    Exclusive,
    /// Completion of an in-flight page read
    PageIo,
}

/// Cell lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Free,
    Reserved,
    WakingUp,
}

/// Handle to a reserved cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellId(usize);

impl CellId {
    pub fn index(self) -> usize {
        self.0
    }
}

// =============================================================================
// Cells
// =============================================================================

#[derive(Debug)]
struct Cell {
    state: CellState,
    object: Option<ObjectId>,
    kind: WaitKind,
    thread: Option<ThreadKey>,
    thread_name: Option<String>,
    reserved_at: Option<Instant>,
    reserved_wall: Option<DateTime<Utc>>,
    waiting: bool,
    signal_count: u64,
    event: Arc<Event>,
}

impl Cell {
    fn new() -> Self {
        Self {
            state: CellState::Free,
            object: None,
            kind: WaitKind::Exclusive,
            thread: None,
            thread_name: None,
            reserved_at: None,
            reserved_wall: None,
            waiting: false,
            signal_count: 0,
            event: Arc::new(Event::new()),
        }
    }

    fn clear(&mut self) {
        self.state = CellState::Free;
        self.object = None;
        self.thread = None;
        self.thread_name = None;
        self.reserved_at = None;
        self.reserved_wall = None;
        self.waiting = false;
    }

    fn thread_label(&self) -> String {
        match (self.thread, &self.thread_name) {
            (Some(k), Some(name)) => format!("{} ({})", k.0, name),
            (Some(k), None) => k.0.to_string(),
            _ => "?".to_string(),
        }
    }
}

#[derive(Debug)]
struct ArrayInner {
    cells: Vec<Cell>,
    /// Cells in `Reserved`
    reserved: usize,
    /// Cells in `WakingUp`
    waking: usize,
}

/// Serializable view of one occupied cell
#[derive(Debug, Clone, Serialize)]
pub struct CellInfo {
    pub index: usize,
    pub state: CellState,
    pub object: Option<ObjectId>,
    pub object_name: String,
    pub kind: WaitKind,
    pub thread: Option<ThreadKey>,
    pub thread_name: Option<String>,
    pub waiting: bool,
    pub reserved_at: Option<DateTime<Utc>>,
    pub waited_ms: u64,
}

/// Result of a long-wait sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Cells currently reserved
    pub reserved: usize,
    /// Cells over the warning threshold
    pub warnings: usize,
    /// Longest current wait
    pub longest_wait_ms: u64,
}

/// Counters over the array's lifetime
#[derive(Debug, Clone, Default, Serialize)]
pub struct WaitStats {
    pub cells: usize,
    pub reserved: usize,
    pub waking: usize,
    pub reservations: u64,
    pub signals: u64,
    pub deadlocks: u64,
    pub long_waits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reservations: AtomicU64,
    signals: AtomicU64,
    deadlocks: AtomicU64,
    long_waits: AtomicU64,
}

/// Named range of object ids, for diagnostics
#[derive(Debug)]
struct ObjectRange {
    base: u64,
    len: u64,
    name: String,
}

// =============================================================================
// Wait Array
// =============================================================================

/// Table of wait cells
pub struct WaitArray {
    inner: Mutex<ArrayInner>,
    /// Current exclusive holder of each object (deadlock detection only)
    holders: Mutex<HashMap<ObjectId, ThreadKey>>,
    names: RwLock<Vec<ObjectRange>>,
    next_object: AtomicU64,
    deadlock_detection: bool,
    long_wait_warning: Duration,
    long_wait_fatal: Duration,
    policy: FatalPolicy,
    counters: Counters,
}

impl std::fmt::Debug for WaitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitArray")
            .field("stats", &self.stats())
            .field("deadlock_detection", &self.deadlock_detection)
            .finish()
    }
}

impl WaitArray {
    /// Create an array of `cells` cells with default thresholds
    pub fn new(cells: usize, policy: FatalPolicy) -> Self {
        Self::from_config(
            &SyncConfig {
                wait_cells: cells,
                ..SyncConfig::default()
            },
            policy,
        )
    }

    pub fn from_config(config: &SyncConfig, policy: FatalPolicy) -> Self {
        Self {
            inner: Mutex::new(ArrayInner {
                cells: (0..config.wait_cells).map(|_| Cell::new()).collect(),
                reserved: 0,
                waking: 0,
            }),
            holders: Mutex::new(HashMap::new()),
            names: RwLock::new(Vec::new()),
            next_object: AtomicU64::new(1),
            deadlock_detection: config.deadlock_detection,
            long_wait_warning: config.long_wait_warning(),
            long_wait_fatal: config.long_wait_fatal(),
            policy,
            counters: Counters::default(),
        }
    }

    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    pub fn with_long_wait_thresholds(mut self, warning: Duration, fatal: Duration) -> Self {
        self.long_wait_warning = warning;
        self.long_wait_fatal = fatal.max(warning);
        self
    }

    pub fn deadlock_detection(&self) -> bool {
        self.deadlock_detection
    }

    pub fn policy(&self) -> FatalPolicy {
        self.policy
    }

    /// Allocate a fresh object id
    pub fn new_object(&self, name: impl Into<String>) -> ObjectId {
        self.new_objects(name, 1)
    }

    /// Allocate `count` consecutive object ids sharing a name
    pub fn new_objects(&self, name: impl Into<String>, count: usize) -> ObjectId {
        let mut names = self.names.write();
        let base = self
            .next_object
            .fetch_add(count.max(1) as u64, Ordering::Relaxed);
        names.push(ObjectRange {
            base,
            len: count.max(1) as u64,
            name: name.into(),
        });
        ObjectId(base)
    }

    /// Human-readable name of an object
    pub fn describe_object(&self, object: ObjectId) -> String {
        let names = self.names.read();
        let idx = names.partition_point(|r| r.base <= object.0);
        match idx.checked_sub(1).map(|i| &names[i]) {
            Some(r) if object.0 < r.base + r.len => {
                if r.len == 1 {
                    r.name.clone()
                } else {
                    format!("{}[{}]", r.name, object.0 - r.base)
                }
            }
            _ => format!("object#{}", object.0),
        }
    }

    // =========================================================================
    // Cell operations
    // =========================================================================

    /// Reserve a free cell for waiting on `object`
    pub fn reserve(&self, object: ObjectId, kind: WaitKind) -> Result<CellId> {
        let mut inner = self.inner.lock();
        let Some(index) = inner.cells.iter().position(|c| c.state == CellState::Free) else {
            let err = Error::WaitArrayExhausted {
                cells: inner.cells.len(),
            };
            return Err(self.policy.escalate(err, || self.describe_cells(&inner)));
        };

        let current = thread::current();
        let cell = &mut inner.cells[index];
        cell.state = CellState::Reserved;
        cell.object = Some(object);
        cell.kind = kind;
        cell.thread = Some(ThreadKey::current());
        cell.thread_name = current.name().map(str::to_owned);
        cell.reserved_at = Some(Instant::now());
        cell.reserved_wall = Some(Utc::now());
        cell.waiting = false;
        cell.signal_count = cell.event.reset();
        inner.reserved += 1;

        self.counters.reservations.fetch_add(1, Ordering::Relaxed);
        Ok(CellId(index))
    }

    /// Block on a reserved cell until its object is signalled, then free it.
    ///
    /// With deadlock detection on, a cycle through this waiter frees the cell
    /// and escalates [`Error::Deadlock`].
    pub fn wait(&self, cell: CellId) -> Result<()> {
        let (event, since) = {
            let mut inner = self.inner.lock();
            let state = match inner.cells.get(cell.0) {
                Some(c) => c.state,
                None => {
                    return Err(Error::invariant(
                        "wait_array",
                        format!("cell {} out of range", cell.0),
                    ))
                }
            };
            if state == CellState::Free {
                let err = Error::invariant("wait_array", format!("wait on free cell {}", cell.0));
                return Err(self.policy.escalate(err, || self.describe_cells(&inner)));
            }
            inner.cells[cell.0].waiting = true;

            if self.deadlock_detection && state == CellState::Reserved {
                if let Some(chain) = self.find_deadlock(&inner, cell.0) {
                    self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                    let err = Error::Deadlock { chain };
                    let snapshot = self.describe_cells(&inner);
                    inner.cells[cell.0].clear();
                    inner.reserved -= 1;
                    return Err(self.policy.escalate(err, || snapshot));
                }
            }

            let c = &inner.cells[cell.0];
            (Arc::clone(&c.event), c.signal_count)
        };

        event.wait(since);
        self.free(cell)
    }

    /// Wake every thread waiting on `object`; returns how many were woken
    pub fn signal(&self, object: ObjectId) -> usize {
        let mut inner = self.inner.lock();
        let mut woken = 0;
        for cell in inner.cells.iter_mut() {
            if cell.state == CellState::Reserved && cell.object == Some(object) {
                cell.state = CellState::WakingUp;
                cell.event.set();
                woken += 1;
            }
        }
        inner.reserved -= woken;
        inner.waking += woken;
        drop(inner);

        if woken > 0 {
            self.counters.signals.fetch_add(woken as u64, Ordering::Relaxed);
        }
        woken
    }

    /// Return a cell to the free pool.
    ///
    /// Normally called on a `WakingUp` cell after the wait; a `Reserved` cell
    /// is cancelled (the waiter's condition became true before it blocked).
    pub fn free(&self, cell: CellId) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.cells.get(cell.0).map(|c| c.state);
        match state {
            Some(CellState::Reserved) => inner.reserved -= 1,
            Some(CellState::WakingUp) => inner.waking -= 1,
            Some(CellState::Free) | None => {
                let err = Error::invariant("wait_array", format!("free of unreserved cell {}", cell.0));
                return Err(self.policy.escalate(err, || self.describe_cells(&inner)));
            }
        }
        inner.cells[cell.0].clear();
        Ok(())
    }

    /// Block until `ready()` holds, using the wait array between checks.
    ///
    /// The predicate must become true only together with a later
    /// `signal(object)`.
    pub fn wait_until<F>(&self, object: ObjectId, kind: WaitKind, mut ready: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        loop {
            if ready() {
                return Ok(());
            }
            let cell = self.reserve(object, kind)?;
            if ready() {
                return self.free(cell);
            }
            self.wait(cell)?;
        }
    }

    // =========================================================================
    // Holders
    // =========================================================================

    /// Record the calling thread as exclusive holder of `object`
    pub fn note_holder(&self, object: ObjectId) {
        if self.deadlock_detection {
            self.holders.lock().insert(object, ThreadKey::current());
        }
    }

    /// Forget the holder of `object`
    pub fn clear_holder(&self, object: ObjectId) {
        if self.deadlock_detection {
            self.holders.lock().remove(&object);
        }
    }

    fn find_deadlock(&self, inner: &ArrayInner, start: usize) -> Option<String> {
        let holders = self.holders.lock();
        let me = inner.cells[start].thread?;
        let mut object = inner.cells[start].object?;
        let mut seen = HashSet::new();
        seen.insert(me);

        let mut chain = format!(
            "thread {} waits for {}",
            inner.cells[start].thread_label(),
            self.describe_object(object)
        );
        loop {
            let holder = *holders.get(&object)?;
            if holder == me {
                let _ = write!(chain, " held by thread {}", me.0);
                debug!(chain = %chain, "wait-for cycle found");
                return Some(chain);
            }
            if !seen.insert(holder) {
                // A cycle that does not include us; its own members report it.
                return None;
            }
            let cell = inner.cells.iter().find(|c| {
                c.state == CellState::Reserved && c.waiting && c.thread == Some(holder)
            })?;
            object = cell.object?;
            let _ = write!(
                chain,
                " held by thread {}, which waits for {}",
                cell.thread_label(),
                self.describe_object(object)
            );
        }
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Scan for over-long waits: log those past the warning threshold and
    /// escalate [`Error::LongWait`] for the first past the fatal threshold.
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut report = SweepReport::default();

        for (index, cell) in inner.cells.iter().enumerate() {
            if cell.state != CellState::Reserved {
                continue;
            }
            report.reserved += 1;
            let waited = cell
                .reserved_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            report.longest_wait_ms = report.longest_wait_ms.max(waited.as_millis() as u64);

            let object = cell
                .object
                .map(|o| self.describe_object(o))
                .unwrap_or_default();
            if waited >= self.long_wait_fatal {
                self.counters.long_waits.fetch_add(1, Ordering::Relaxed);
                let err = Error::LongWait {
                    object,
                    thread: cell.thread_label(),
                    waited_secs: waited.as_secs(),
                    limit_secs: self.long_wait_fatal.as_secs(),
                };
                return Err(self.policy.escalate(err, || self.describe_cells(&inner)));
            }
            if waited >= self.long_wait_warning {
                report.warnings += 1;
                warn!(
                    cell = index,
                    object = %object,
                    thread = %cell.thread_label(),
                    waited_ms = waited.as_millis() as u64,
                    "long semaphore wait"
                );
            }
        }
        Ok(report)
    }

    /// Check that the state counters agree with the cells
    pub fn validate(&self) -> Result<()> {
        let inner = self.inner.lock();
        let reserved = inner
            .cells
            .iter()
            .filter(|c| c.state == CellState::Reserved)
            .count();
        let waking = inner
            .cells
            .iter()
            .filter(|c| c.state == CellState::WakingUp)
            .count();
        if reserved != inner.reserved || waking != inner.waking {
            let err = Error::invariant(
                "wait_array",
                format!(
                    "counted {} reserved / {} waking cells, recorded {} / {}",
                    reserved, waking, inner.reserved, inner.waking
                ),
            );
            return Err(self.policy.escalate(err, || self.describe_cells(&inner)));
        }
        Ok(())
    }

    /// Number of cells in `Reserved`
    pub fn reserved_count(&self) -> usize {
        self.inner.lock().reserved
    }

    /// Number of cells in `WakingUp`
    pub fn waking_count(&self) -> usize {
        self.inner.lock().waking
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cells.len()
    }

    pub fn stats(&self) -> WaitStats {
        let inner = self.inner.lock();
        WaitStats {
            cells: inner.cells.len(),
            reserved: inner.reserved,
            waking: inner.waking,
            reservations: self.counters.reservations.load(Ordering::Relaxed),
            signals: self.counters.signals.load(Ordering::Relaxed),
            deadlocks: self.counters.deadlocks.load(Ordering::Relaxed),
            long_waits: self.counters.long_waits.load(Ordering::Relaxed),
        }
    }

    /// Occupied cells, for diagnostics
    pub fn snapshot(&self) -> Vec<CellInfo> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state != CellState::Free)
            .map(|(index, c)| CellInfo {
                index,
                state: c.state,
                object: c.object,
                object_name: c.object.map(|o| self.describe_object(o)).unwrap_or_default(),
                kind: c.kind,
                thread: c.thread,
                thread_name: c.thread_name.clone(),
                waiting: c.waiting,
                reserved_at: c.reserved_wall,
                waited_ms: c
                    .reserved_at
                    .map(|t| now.saturating_duration_since(t).as_millis() as u64)
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Dump of the occupied cells
    pub fn diagnostics(&self) -> String {
        let inner = self.inner.lock();
        self.describe_cells(&inner)
    }

    fn describe_cells(&self, inner: &ArrayInner) -> String {
        let now = Instant::now();
        let mut out = format!(
            "wait array: {} cells, {} reserved, {} waking up\n",
            inner.cells.len(),
            inner.reserved,
            inner.waking
        );
        for (index, cell) in inner.cells.iter().enumerate() {
            if cell.state == CellState::Free {
                continue;
            }
            let waited = cell
                .reserved_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            let object = cell
                .object
                .map(|o| self.describe_object(o))
                .unwrap_or_default();
            let holder = cell
                .object
                .and_then(|o| self.holders.try_lock().and_then(|h| h.get(&o).copied()));
            let _ = writeln!(
                out,
                "  cell {}: {:?} by thread {} on {} ({:?}) for {:.3}s{}{}{}",
                index,
                cell.state,
                cell.thread_label(),
                object,
                cell.kind,
                waited.as_secs_f64(),
                if cell.waiting { ", waiting" } else { "" },
                holder
                    .map(|h| format!(", held by thread {}", h.0))
                    .unwrap_or_default(),
                cell.reserved_wall
                    .map(|t| format!(", since {}", t.to_rfc3339()))
                    .unwrap_or_default(),
            );
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
