//! Binary event with signal counting
//!
//! A manual-reset event: `set` wakes every waiter and leaves the event set
//! until `reset`. `reset` returns the current signal count and a waiter
//! passes it back to `wait`, which returns as soon as the event is set *or*
//! the count has moved on. A `set` landing between `reset` and `wait` is
//! therefore never lost.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct EventState {
    set: bool,
    signal_count: u64,
}

/// Manual-reset event
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<EventState>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the event and return the signal count to wait on
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.set = false;
        state.signal_count
    }

    /// Set the event and wake all waiters
    pub fn set(&self) {
        let mut state = self.state.lock();
        if !state.set {
            state.set = true;
            state.signal_count += 1;
            self.cv.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    pub fn signal_count(&self) -> u64 {
        self.state.lock().signal_count
    }

    /// Block until the event is set or signalled since `since`
    pub fn wait(&self, since: u64) {
        let mut state = self.state.lock();
        while !state.set && state.signal_count == since {
            self.cv.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_before_wait_is_not_lost() {
        let event = Event::new();
        let since = event.reset();
        event.set();
        // Returns immediately
        event.wait(since);
        assert!(event.is_set());
        assert_eq!(event.signal_count(), since + 1);
    }

    #[test]
    fn test_reset_then_set_again() {
        let event = Event::new();
        event.set();
        let since = event.reset();
        assert!(!event.is_set());
        assert_eq!(since, 1);
        event.set();
        event.wait(since);
        assert_eq!(event.signal_count(), 2);
    }

    #[test]
    fn test_wakes_blocked_thread() {
        let event = Arc::new(Event::new());
        let since = event.reset();
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(since))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        waiter.join().unwrap();
    }
}
