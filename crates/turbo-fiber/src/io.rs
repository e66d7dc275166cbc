//! Fiber-aware epoll/kqueue I/O.
//!
//! One (or a few) reactor threads block in the kernel's readiness
//! multiplexer, and a fiber that wants to wait on a file descriptor
//! registers interest and suspends instead of calling `read`/`write`
//! directly. The multiplexer is `polling` (epoll on Linux, kqueue on
//! BSD/macOS); it was picked over an edge-triggered abstraction like
//! `mio` because it exposes level-triggered readiness directly,
//! matching the register-once-per-wait usage pattern here without
//! needing an edge-triggered readiness cache on top.
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};

use crate::config::Config;
use crate::entity::{WaitState, WaiterOutcome};
use crate::error::Status;
use crate::id::FiberId;
use crate::runtime::runtime;
use crate::stack::SwitchReason;
use crate::worker;

struct Registration {
    fiber: FiberId,
}

struct Reactor {
    poller: Poller,
    registrations: Mutex<HashMap<RawFd, Registration>>,
}

/// Owns one or more reactor threads and the fd -> waiter registry.
pub struct IoReactor {
    reactors: Vec<Arc<Reactor>>,
}

impl IoReactor {
    pub fn start(config: &Config) -> Self {
        let count = config.io_thread_count.max(1);
        let mut reactors = Vec::with_capacity(count);
        for index in 0..count {
            let reactor = Arc::new(Reactor {
                poller: Poller::new().expect("failed to create the I/O poller"),
                registrations: Mutex::new(HashMap::new()),
            });
            let worker_reactor = reactor.clone();
            std::thread::Builder::new()
                .name(format!("turbo-fiber-io-{index}"))
                .spawn(move || reactor_loop(worker_reactor))
                .expect("failed to spawn the I/O reactor thread");
            reactors.push(reactor);
        }
        Self { reactors }
    }

    fn pick(&self, fd: RawFd) -> &Arc<Reactor> {
        let index = (fd as usize).wrapping_mul(0x9E37_79B9) % self.reactors.len();
        &self.reactors[index]
    }
}

fn reactor_loop(reactor: Arc<Reactor>) {
    let mut events = Events::new();
    loop {
        events.clear();
        if reactor.poller.wait(&mut events, None).is_err() {
            continue;
        }
        for event in events.iter() {
            let fd = event.key as RawFd;
            let registration = reactor.registrations.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd);
            let _ = reactor.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
            if let Some(registration) = registration {
                claim(registration.fiber, WaiterOutcome::Ready);
            }
        }
    }
}

fn claim(fiber_id: FiberId, outcome: WaiterOutcome) -> bool {
    let Some(pool_id) = fiber_id.to_pool_id() else { return false };
    let claimed = runtime()
        .fibers
        .with_mut(pool_id, |entity| match &mut entity.wait_state {
            WaitState::Fd { outcome: current, timer, .. } if *current == WaiterOutcome::Pending => {
                *current = outcome;
                timer.take()
            }
            _ => None,
        })
        .unwrap_or(None);

    let was_registered = claimed.is_some();
    if let Some(timer_id) = claimed {
        let _ = runtime().timers.unschedule(timer_id);
    }
    if was_registered {
        worker::enqueue(fiber_id, false);
    }
    was_registered
}

/// Blocks the current fiber until `fd` becomes readable (or writable,
/// per `writable`), `timeout` elapses, or the fd is closed out from
/// under the wait via [`fd_close`].
pub fn fd_wait(fd: RawFd, writable: bool, timeout: Option<Duration>) -> Result<(), Status> {
    let fiber_id = worker::current_fiber_id().ok_or(Status::EInval)?;
    let reactor = runtime().io.pick(fd).clone();
    let deadline = timeout.map(|d| Instant::now() + d);

    let remained: worker::RemainedFn = Box::new(move || {
        {
            let mut registrations = reactor.registrations.lock().unwrap_or_else(|e| e.into_inner());
            registrations.insert(fd, Registration { fiber: fiber_id });
        }

        let event = if writable { Event::writable(fd as usize) } else { Event::readable(fd as usize) };
        let add_result = unsafe { reactor.poller.add(&BorrowedFd::borrow_raw(fd), event) };
        if add_result.is_err() {
            reactor.registrations.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd);
            claim(fiber_id, WaiterOutcome::Closed);
            return;
        }

        let timer = deadline.and_then(|deadline| {
            runtime().timers.schedule(deadline, Box::new(move || { on_fd_timeout(fd, fiber_id); })).ok()
        });

        if let Some(pool_id) = fiber_id.to_pool_id() {
            let _ = runtime().fibers.with_mut(pool_id, |entity| {
                entity.wait_state = WaitState::Fd { fd, outcome: WaiterOutcome::Pending, timer };
            });
        }
    });

    worker::block_current(SwitchReason::WaitingOnFd, remained)?;

    let outcome = fiber_id
        .to_pool_id()
        .and_then(|pool_id| {
            runtime()
                .fibers
                .with_mut(pool_id, |entity| match std::mem::replace(&mut entity.wait_state, WaitState::Idle) {
                    WaitState::Fd { outcome, .. } => outcome,
                    _ => WaiterOutcome::Ready,
                })
                .ok()
        })
        .unwrap_or(WaiterOutcome::Ready);

    match outcome {
        WaiterOutcome::Ready | WaiterOutcome::Pending => Ok(()),
        WaiterOutcome::TimedOut => Err(Status::ETimedOut),
        WaiterOutcome::Interrupted => Err(Status::EIntr),
        WaiterOutcome::Closed => Err(Status::EBadF),
        WaiterOutcome::Unmatched => Err(Status::EWouldBlock),
    }
}

fn on_fd_timeout(fd: RawFd, fiber_id: FiberId) {
    let reactor = runtime().io.pick(fd);
    reactor.registrations.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd);
    let _ = reactor.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
    claim(fiber_id, WaiterOutcome::TimedOut);
}

/// Forces a fiber currently in [`fd_wait`] to resolve as interrupted.
/// Used by `interrupt()`. No-op if the fiber isn't waiting on an fd.
pub(crate) fn force_interrupt(fiber_id: FiberId) -> bool {
    claim(fiber_id, WaiterOutcome::Interrupted)
}

/// Deregisters `fd` from its reactor, closes it, and wakes any fiber
/// currently parked on it with success — the woken fiber observes the
/// closed descriptor from its next syscall, not from this call's
/// return value. A subsequent `fd_wait` on the same descriptor number
/// fails to register with the reactor and resolves with
/// [`Status::EBadF`] instead.
///
/// Returns [`Status::EBadF`] if `fd` has no live registration, which
/// covers both an fd that was never waited on and one already closed
/// by an earlier `fd_close` call.
pub fn fd_close(fd: RawFd) -> Result<(), Status> {
    let reactor = runtime().io.pick(fd);
    let registration = reactor.registrations.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd);
    let _ = reactor.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
    drop(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) });
    match registration {
        Some(registration) => {
            claim(registration.fiber, WaiterOutcome::Ready);
            Ok(())
        }
        None => Err(Status::EBadF),
    }
}
