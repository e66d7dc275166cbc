//! The timer service: a dedicated OS thread that fires callbacks at a
//! deadline, used for `sleep()`, wait timeouts, and fd-wait timeouts.
//!
//! A single thread runs over a min-heap of deadlines guarded by a
//! mutex and condvar. Cancellation is lock-free (`unschedule` flips an
//! atomic tag rather than removing from the heap), which avoids
//! needing to search or rebuild the heap under the lock; a canceled
//! entry is simply skipped when the timer thread eventually pops it.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::Status;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled timer for later cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELED: u8 = 2;

struct Entry {
    state: AtomicU8,
    callback: Mutex<Option<TimerCallback>>,
}

struct Heap {
    order: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Arc<Entry>>,
    next_seq: u64,
    stop: bool,
}

/// Owns the timer thread and the heap of pending deadlines.
pub struct TimerThread {
    state: Mutex<Heap>,
    condvar: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TimerThread {
    pub fn start() -> Arc<Self> {
        let this = Arc::new(Self {
            state: Mutex::new(Heap {
                order: BinaryHeap::new(),
                entries: HashMap::new(),
                next_seq: 0,
                stop: false,
            }),
            condvar: Condvar::new(),
            thread: Mutex::new(None),
        });

        let worker = this.clone();
        let handle = std::thread::Builder::new()
            .name("turbo-fiber-timer".into())
            .spawn(move || worker.run())
            .expect("failed to spawn the timer thread");
        *this.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        this
    }

    /// Schedules `callback` to run on the timer thread at `deadline`.
    ///
    /// Returns [`Status::EStop`] if the timer thread has already been
    /// asked to stop (mirrors `fiber_timer_add`'s `ESTOP`); this crate
    /// never surfaces `ENOMEM` since allocation failure here is treated
    /// like any other allocation failure (an abort), not a recoverable
    /// error path, matching how the rest of this crate handles it.
    pub fn schedule(&self, deadline: Instant, callback: TimerCallback) -> Result<TimerId, Status> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.stop {
            return Err(Status::EStop);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = Arc::new(Entry {
            state: AtomicU8::new(PENDING),
            callback: Mutex::new(Some(callback)),
        });
        state.entries.insert(seq, entry);
        state.order.push(Reverse((deadline, seq)));
        drop(state);
        self.condvar.notify_one();
        Ok(TimerId(seq))
    }

    /// Cancels a previously scheduled timer.
    ///
    /// Returns `Ok(())` if the cancellation raced ahead of the timer
    /// thread, [`Status::Busy`] if the callback had already started (or
    /// finished) running, and [`Status::NotFound`] for an unknown id.
    pub fn unschedule(&self, id: TimerId) -> Result<(), Status> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = state.entries.get(&id.0).cloned() else {
            return Err(Status::NotFound);
        };
        drop(state);
        match entry.state.compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(_) => Err(Status::Busy),
        }
    }

    /// Stops accepting new timers and joins the timer thread. Pending
    /// callbacks that have already fired are allowed to finish; ones
    /// still waiting are simply dropped.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stop = true;
        drop(state);
        self.condvar.notify_all();
        if let Some(handle) = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.stop {
                return;
            }
            match state.order.peek().copied() {
                None => {
                    state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                Some(Reverse((deadline, seq))) => {
                    let now = Instant::now();
                    if deadline > now {
                        let (guard, _) = self
                            .condvar
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(|e| e.into_inner());
                        state = guard;
                        continue;
                    }
                    state.order.pop();
                    let entry = state.entries.remove(&seq);
                    drop(state);
                    if let Some(entry) = entry {
                        let fired = entry
                            .state
                            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok();
                        if fired {
                            if let Some(callback) = entry.callback.lock().unwrap_or_else(|e| e.into_inner()).take() {
                                callback();
                            }
                        }
                    }
                    state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimerThread;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn fires_after_deadline() {
        let timers = TimerThread::start();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timers
            .schedule(Instant::now() + Duration::from_millis(20), Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
        timers.stop();
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        let timers = TimerThread::start();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = timers
            .schedule(Instant::now() + Duration::from_millis(50), Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        timers.unschedule(id).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!fired.load(Ordering::SeqCst));
        timers.stop();
    }

    #[test]
    fn cancel_after_fire_is_busy() {
        let timers = TimerThread::start();
        let id = timers.schedule(Instant::now(), Box::new(|| {})).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(timers.unschedule(id).is_err());
        timers.stop();
    }

    #[test]
    fn unknown_id_is_not_found() {
        let timers = TimerThread::start();
        let id = timers.schedule(Instant::now() + Duration::from_secs(10), Box::new(|| {})).unwrap();
        timers.unschedule(id).unwrap();
        assert!(timers.unschedule(id).is_err());
        timers.stop();
    }
}
