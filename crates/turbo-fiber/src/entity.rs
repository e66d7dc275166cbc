//! The per-fiber record and its lifecycle.
use std::sync::{Arc, Condvar, Mutex};

use crate::attr::Attr;
use crate::event::EventHandle;
use crate::id::FiberId;
use crate::stack::FiberStack;
use crate::timer::TimerId;

/// Scheduling/accounting counters carried by a fiber across its runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub cputime_ns: u64,
    pub nswitch: u64,
}

/// The body a fiber runs. Boxed so `FiberEntity` doesn't need a
/// generic parameter; this is the Rust analog of the C `fn(arg)`
/// pair, with the argument captured by the closure instead of passed
/// as a `*void`.
pub type FiberBody = Box<dyn FnOnce() + Send + 'static>;

/// The outcome recorded on a fiber's waiter record by whichever path
/// resolves it (a `wake_*` call, the timer thread, or `interrupt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterOutcome {
    Pending,
    Ready,
    TimedOut,
    Unmatched,
    Interrupted,
    /// The fd a fiber was waiting on was closed out from under it.
    Closed,
}

/// What a fiber is currently blocked on, if anything.
///
/// Represented as variants of one enum rather than several
/// independently nullable fields, which makes "a fiber blocks on at
/// most one thing" a structural guarantee instead of an invariant
/// callers must maintain by hand.
pub enum WaitState {
    Idle,
    Event { event: EventHandle, expected: u32, timer: Option<TimerId>, outcome: WaiterOutcome },
    Sleep(TimerId),
    Fd { fd: std::os::unix::io::RawFd, outcome: WaiterOutcome, timer: Option<TimerId> },
}

/// Signaled once when a fiber completes, so `join` can block on a
/// `Condvar` instead of busy-polling the version counter.
#[derive(Default)]
pub struct Completion {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    pub fn mark_done(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.condvar.notify_all();
    }

    pub fn wait(&self) {
        let guard = self.done.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.condvar.wait_while(guard, |done| !*done).unwrap_or_else(|e| e.into_inner()));
    }

    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let guard = self.done.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The per-fiber record allocated from the fiber pool, plus the
/// ambient fields a diagnosable runtime needs on top of the core
/// scheduling state: a `name` for logging and the concrete `Stats`
/// shape.
pub struct FiberEntity {
    pub id: FiberId,
    pub stop: bool,
    pub interrupted: bool,
    pub about_to_quit: bool,
    pub body: Option<FiberBody>,
    pub stack: Option<FiberStack>,
    pub attr: Attr,
    pub name: Option<Box<str>>,
    pub cpuwide_start_ns: u64,
    pub stats: Stats,
    pub wait_state: WaitState,
    pub completion: Arc<Completion>,
}

impl FiberEntity {
    pub fn new(attr: Attr, name: Option<Box<str>>, body: FiberBody) -> Self {
        Self {
            id: FiberId::NONE,
            stop: false,
            interrupted: false,
            about_to_quit: false,
            body: Some(body),
            stack: None,
            attr,
            name,
            cpuwide_start_ns: 0,
            stats: Stats::default(),
            wait_state: WaitState::Idle,
            completion: Arc::new(Completion::default()),
        }
    }
}
