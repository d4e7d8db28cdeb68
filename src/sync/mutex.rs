//! Wait-array backed mutex
//!
//! `WaitMutex<T>` first tries the parking_lot mutex, spins for a configured
//! number of rounds, and then parks through the [`WaitArray`], so a blocked
//! acquirer is visible to the long-wait sweep and to deadlock detection.
//!
//! Release protocol: the unlocker drops the inner guard, issues a `SeqCst`
//! fence and signals the object only if the waiter count is non-zero. A
//! waiter increments the count *before* reserving its cell and retries the
//! lock after the reservation, so either the unlocker sees the waiter or the
//! waiter sees the unlocked mutex.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::wait_array::{ObjectId, WaitArray, WaitKind};
use crate::error::Result;

/// Mutex whose slow path goes through the wait array
pub struct WaitMutex<T> {
    inner: Mutex<T>,
    object: ObjectId,
    waiters: AtomicUsize,
    spin_rounds: u32,
    array: Arc<WaitArray>,
}

impl<T> WaitMutex<T> {
    pub fn new(value: T, name: &str, array: Arc<WaitArray>, spin_rounds: u32) -> Self {
        let object = array.new_object(name);
        Self {
            inner: Mutex::new(value),
            object,
            waiters: AtomicUsize::new(0),
            spin_rounds,
            array,
        }
    }

    /// Object id used in wait cells
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Threads currently between announcing themselves and acquiring
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn try_lock(&self) -> Option<WaitMutexGuard<'_, T>> {
        self.inner.try_lock().map(|g| self.guard(g))
    }

    /// Acquire, blocking through the wait array if needed.
    ///
    /// Fails only when the wait array escalates (deadlock, exhaustion) under
    /// [`FatalPolicy::Propagate`](crate::error::FatalPolicy::Propagate).
    pub fn lock(&self) -> Result<WaitMutexGuard<'_, T>> {
        loop {
            if let Some(g) = self.try_lock() {
                return Ok(g);
            }
            for _ in 0..self.spin_rounds {
                std::hint::spin_loop();
                if let Some(g) = self.try_lock() {
                    return Ok(g);
                }
            }

            self.waiters.fetch_add(1, Ordering::SeqCst);
            let cell = match self.array.reserve(self.object, WaitKind::Exclusive) {
                Ok(cell) => cell,
                Err(e) => {
                    self.waiters.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            };
            fence(Ordering::SeqCst);

            if let Some(g) = self.inner.try_lock() {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                self.array.free(cell)?;
                return Ok(self.guard(g));
            }

            let waited = self.array.wait(cell);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            waited?;
        }
    }

    fn guard<'a>(&'a self, guard: MutexGuard<'a, T>) -> WaitMutexGuard<'a, T> {
        self.array.note_holder(self.object);
        WaitMutexGuard {
            mutex: self,
            guard: Some(guard),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for WaitMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitMutex")
            .field("object", &self.object)
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// RAII guard of a [`WaitMutex`]
pub struct WaitMutexGuard<'a, T> {
    mutex: &'a WaitMutex<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> WaitMutexGuard<'_, T> {
    /// Release the lock for the duration of `f` and re-acquire it afterwards
    pub fn unlocked<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        self.release();
        let result = f();
        let mut relocked = self.mutex.lock()?;
        self.guard = relocked.guard.take();
        Ok(result)
    }

    fn release(&mut self) {
        if let Some(g) = self.guard.take() {
            self.mutex.array.clear_holder(self.mutex.object);
            drop(g);
            fence(Ordering::SeqCst);
            if self.mutex.waiters.load(Ordering::SeqCst) > 0 {
                self.mutex.array.signal(self.mutex.object);
            }
        }
    }
}

impl<T> Deref for WaitMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(g) => g,
            None => unreachable!("guard used while released"),
        }
    }
}

impl<T> DerefMut for WaitMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(g) => g,
            None => unreachable!("guard used while released"),
        }
    }
}

impl<T> Drop for WaitMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}
