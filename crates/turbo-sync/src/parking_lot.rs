//! A futex-style parking point for idle workers.
//!
//! Mirrors `turbo::fiber_internal::ParkingLot`: a single word tracks a
//! generation counter (bumped on every `signal`) and a stopped bit in
//! the low bit. Workers read the word, decide there is nothing to do,
//! and call `wait` with the word they observed; if nobody has called
//! `signal` or `stop` in the meantime the wait actually blocks,
//! otherwise it returns immediately. This is the same "check, then
//! wait only if the state you checked is still current" shape as a
//! Linux futex, implemented here on top of `Condvar` since stable Rust
//! has no portable atomic wait/wake.
use std::sync::{Condvar, Mutex};

/// A snapshot of a [`ParkingLot`]'s generation, obtained from
/// [`ParkingLot::get_state`] and later passed to [`ParkingLot::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParkingState(u64);

impl ParkingState {
    /// Returns `true` if the parking lot had already been stopped when
    /// this state was captured.
    pub fn stopped(&self) -> bool {
        self.0 & 1 != 0
    }
}

/// Parks idle workers until another thread has work for them.
///
/// A schedule group keeps a small fixed array of these (one per
/// "parking lot index", hashed from the worker id) instead of a
/// single global one, so that waking one sleeper doesn't require
/// scanning every worker in the group.
pub struct ParkingLot {
    state: Mutex<u64>,
    condvar: Condvar,
}

impl ParkingLot {
    /// Creates a new, unstopped parking lot.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Wakes at most `num_task` parked waiters.
    ///
    /// Returns the number of waiters actually woken. Since this
    /// implementation parks on a `Condvar` rather than a raw futex, it
    /// cannot cheaply know how many threads are asleep, so it wakes
    /// `num_task` of them via `notify_one` in a loop and reports that
    /// count (the original's "0 woken" case for num_task == 0 is
    /// preserved).
    pub fn signal(&self, num_task: usize) -> usize {
        if num_task == 0 {
            return 0;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = state.wrapping_add(2);
        }
        for _ in 0..num_task {
            self.condvar.notify_one();
        }
        num_task
    }

    /// Captures the current generation, to be passed to [`Self::wait`].
    pub fn get_state(&self) -> ParkingState {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ParkingState(*state)
    }

    /// Blocks until `signal` or `stop` is called, unless the state has
    /// already changed since `expected_state` was captured.
    pub fn wait(&self, expected_state: ParkingState) {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != expected_state.0 {
            return;
        }
        drop(
            self.condvar
                .wait_while(guard, |state| *state == expected_state.0)
                .unwrap_or_else(|e| e.into_inner()),
        );
    }

    /// Blocks as in [`Self::wait`], but gives up after `timeout` and
    /// returns `false` without having observed a new generation.
    pub fn wait_timeout(&self, expected_state: ParkingState, timeout: std::time::Duration) -> bool {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != expected_state.0 {
            return true;
        }
        let (guard, result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |state| *state == expected_state.0)
            .unwrap_or_else(|e| e.into_inner());
        drop(guard);
        !result.timed_out()
    }

    /// Wakes every waiter and marks the lot permanently stopped; any
    /// future `wait` call returns immediately.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state |= 1;
        }
        self.condvar.notify_all();
    }
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ParkingLot;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_on_stale_state() {
        let lot = ParkingLot::new();
        let state = lot.get_state();
        lot.signal(1);
        lot.wait(state); // state already advanced, must not block
    }

    #[test]
    fn stop_marks_state_and_wakes_waiters() {
        let lot = Arc::new(ParkingLot::new());
        let state = lot.get_state();
        assert!(!state.stopped());

        let waiter = {
            let lot = lot.clone();
            std::thread::spawn(move || lot.wait(state))
        };

        std::thread::sleep(Duration::from_millis(20));
        lot.stop();
        waiter.join().unwrap();

        assert!(lot.get_state().stopped());
    }

    #[test]
    fn wait_timeout_expires_without_signal() {
        let lot = ParkingLot::new();
        let state = lot.get_state();
        assert!(!lot.wait_timeout(state, Duration::from_millis(10)));
    }
}
