//! An M:N cooperative fiber scheduler: work-stealing worker threads
//! run many more fibers than there are OS threads, switching between
//! them with a stackful coroutine rather than relying on `async`/
//! `await` and a `Future` state machine.
//!
//! A fiber is a unit of cooperative scheduling ([`FiberId`]); a small
//! fixed pool of worker OS threads runs them, stealing work from each
//! other when idle. Fibers can sleep, wait on a futex-style
//! [`WaitableEvent`], or block on a file descriptor's readiness
//! without tying up the worker thread underneath them.
mod attr;
mod config;
mod entity;
mod error;
mod event;
mod id;
mod io;
mod runtime;
mod schedule_group;
mod stack;
mod timer;
mod worker;
mod xor_shift;

use std::os::fd::RawFd;
use std::time::Duration;

pub use attr::{Attr, AttrFlags, StackKind};
pub use config::{Config, ConfigBuilder};
pub use entity::{Stats, WaiterOutcome};
pub use error::{FiberError, FiberResult, Status};
pub use event::EventHandle;
pub use id::FiberId;
pub use timer::TimerId;

use entity::WaitState;
use runtime::runtime;

/// The payload [`exit`] panics with, so the fiber runner's
/// `catch_unwind` can tell a deliberate early exit from an actual
/// panic without logging it as one.
pub(crate) struct FiberExit;

/// Starts a fiber and makes sure it gets a chance to run promptly: any
/// `NO_SIGNAL` batching in `attr` is overridden for this one dispatch.
pub fn start_urgent(attr: Attr, name: Option<&str>, body: impl FnOnce() + Send + 'static) -> FiberId {
    let id = worker::spawn(attr, name.map(Box::from), Box::new(body));
    runtime().group.signal_task(1);
    id
}

/// Starts a fiber and enqueues it normally, honoring `attr`'s
/// `NO_SIGNAL` flag if set.
pub fn start_background(attr: Attr, name: Option<&str>, body: impl FnOnce() + Send + 'static) -> FiberId {
    worker::spawn(attr, name.map(Box::from), Box::new(body))
}

/// Gives up the worker thread so another runnable fiber can run,
/// re-enqueueing the caller at the back of its worker's local queue.
/// A no-op when called outside a fiber, or from a `pthread`-kind fiber
/// (which has no yield point to resume from).
pub fn yield_now() {
    worker::yield_now();
}

/// Suspends the calling fiber for at least `duration`.
///
/// Called outside a fiber, or from a `pthread`-kind fiber (which has
/// no stack to switch away from), this blocks the calling OS thread
/// directly via [`std::thread::sleep`] instead. Such a sleep cannot be
/// interrupted, since there is no yield point to resume from.
pub fn sleep(duration: Duration) -> FiberResult<()> {
    let Some(fiber_id) = worker::current_fiber_id() else {
        std::thread::sleep(duration);
        return Ok(());
    };

    if is_pthread(fiber_id) {
        std::thread::sleep(duration);
        return Ok(());
    }

    let deadline = std::time::Instant::now() + duration;
    let remained: worker::RemainedFn = Box::new(move || {
        match runtime().timers.schedule(deadline, Box::new(move || wake_from_sleep(fiber_id))) {
            Ok(timer_id) => {
                if let Some(pool_id) = fiber_id.to_pool_id() {
                    let _ = runtime().fibers.with_mut(pool_id, |e| e.wait_state = WaitState::Sleep(timer_id));
                }
            }
            Err(_) => {
                // The timer thread is stopping; don't strand the fiber asleep forever.
                wake_from_sleep(fiber_id);
            }
        }
    });

    worker::block_current(stack::SwitchReason::Sleeping, remained)?;

    if !take_interrupted(fiber_id) {
        return Ok(());
    }
    let stopped = fiber_id
        .to_pool_id()
        .and_then(|pool_id| runtime().fibers.with(pool_id, |e| e.stop).ok())
        .unwrap_or(false);
    if stopped {
        Err(Status::EStop)
    } else {
        Err(Status::EIntr)
    }
}

fn wake_from_sleep(fiber_id: FiberId) {
    if let Some(pool_id) = fiber_id.to_pool_id() {
        let _ = runtime().fibers.with_mut(pool_id, |e| e.wait_state = WaitState::Idle);
    }
    worker::enqueue(fiber_id, false);
}

fn is_pthread(fiber_id: FiberId) -> bool {
    fiber_id
        .to_pool_id()
        .and_then(|pool_id| runtime().fibers.with(pool_id, |e| e.attr.stack_kind).ok())
        .map(|kind| kind == StackKind::Pthread)
        .unwrap_or(true)
}

fn take_interrupted(fiber_id: FiberId) -> bool {
    fiber_id
        .to_pool_id()
        .and_then(|pool_id| {
            runtime()
                .fibers
                .with_mut(pool_id, |e| std::mem::replace(&mut e.interrupted, false))
                .ok()
        })
        .unwrap_or(false)
}

/// Ends the calling fiber immediately, running no more of its body.
///
/// Implemented as a panic carrying a private sentinel payload, which
/// the fiber runner recognizes and does not log as a real panic.
/// Never returns; calling it outside a fiber aborts the process, same
/// as any other panic escaping a thread with no catcher.
pub fn exit() -> ! {
    std::panic::panic_any(FiberExit)
}

/// The id of the fiber currently running on this worker thread, or
/// [`FiberId::NONE`] if the caller isn't a fiber.
pub fn self_id() -> FiberId {
    worker::current_fiber_id().unwrap_or(FiberId::NONE)
}

/// Returns `true` if the calling fiber's `stop` flag has been set by a
/// call to [`stop`]. Fibers that want to honor cooperative shutdown
/// should check this periodically in long-running loops.
pub fn stopped() -> bool {
    let Some(id) = worker::current_fiber_id() else { return false };
    id.to_pool_id()
        .and_then(|pool_id| runtime().fibers.with(pool_id, |e| e.stop).ok())
        .unwrap_or(false)
}

enum WaitKind {
    Event,
    Sleep(TimerId),
    Fd,
}

fn wait_kind(pool_id: turbo_sync::PoolId) -> Option<WaitKind> {
    runtime()
        .fibers
        .with_mut(pool_id, |e| {
            e.interrupted = true;
            match &e.wait_state {
                WaitState::Event { .. } => Some(WaitKind::Event),
                WaitState::Sleep(timer_id) => Some(WaitKind::Sleep(*timer_id)),
                WaitState::Fd { .. } => Some(WaitKind::Fd),
                WaitState::Idle => None,
            }
        })
        .ok()
        .flatten()
}

/// Forces any wait currently in progress on `id` to resolve early with
/// [`Status::EIntr`]. A no-op (beyond marking the fiber interrupted,
/// for the next blocking call to observe) if `id` isn't currently
/// blocked on anything this crate tracks. Always a no-op on a fiber
/// started with [`AttrFlags::NEVER_QUIT`].
pub fn interrupt(id: FiberId) -> FiberResult<()> {
    let pool_id = id.to_pool_id().ok_or(Status::EInval)?;
    let never_quit = runtime().fibers.with(pool_id, |e| e.attr.never_quit()).unwrap_or(false);
    if never_quit {
        return Ok(());
    }
    match wait_kind(pool_id) {
        Some(WaitKind::Event) => {
            event::force_interrupt(id);
        }
        Some(WaitKind::Sleep(timer_id)) => {
            if runtime().timers.unschedule(timer_id).is_ok() {
                let _ = runtime().fibers.with_mut(pool_id, |e| e.wait_state = WaitState::Idle);
                worker::enqueue(id, false);
            }
        }
        Some(WaitKind::Fd) => {
            io::force_interrupt(id);
        }
        None => {}
    }
    Ok(())
}

/// Marks `id` stopped (visible to it via [`stopped`]) and interrupts
/// any wait currently in progress, the same as [`interrupt`].
///
/// A no-op on a fiber started with [`AttrFlags::NEVER_QUIT`].
pub fn stop(id: FiberId) -> FiberResult<()> {
    let pool_id = id.to_pool_id().ok_or(Status::EInval)?;
    if runtime().fibers.with(pool_id, |e| e.attr.never_quit()).unwrap_or(false) {
        return Ok(());
    }
    runtime().fibers.with_mut(pool_id, |e| e.stop = true).map_err(|_| Status::EInval)?;
    interrupt(id)
}

/// Blocks until `id` finishes running. Rejects joining the calling
/// fiber's own id with [`Status::EInval`], since a fiber waiting on
/// itself can never be woken.
pub fn join(id: FiberId) -> FiberResult<()> {
    if worker::current_fiber_id() == Some(id) {
        return Err(Status::EInval);
    }
    let pool_id = id.to_pool_id().ok_or(Status::EInval)?;
    let completion = runtime().fibers.with(pool_id, |e| e.completion.clone()).map_err(|_| Status::EInval)?;
    completion.wait();
    Ok(())
}

/// Blocks until `id` finishes running or `timeout` elapses.
pub fn join_timeout(id: FiberId, timeout: Duration) -> FiberResult<()> {
    if worker::current_fiber_id() == Some(id) {
        return Err(Status::EInval);
    }
    let pool_id = id.to_pool_id().ok_or(Status::EInval)?;
    let completion = runtime().fibers.with(pool_id, |e| e.completion.clone()).map_err(|_| Status::EInval)?;
    if completion.wait_timeout(timeout) {
        Ok(())
    } else {
        Err(Status::ETimedOut)
    }
}

/// Returns `true` if `id` names a fiber that hasn't finished running.
pub fn exists(id: FiberId) -> bool {
    id.to_pool_id().map(|pool_id| runtime().fibers.contains(pool_id)).unwrap_or(false)
}

/// Returns the attributes `id` was started with.
pub fn get_attr(id: FiberId) -> FiberResult<Attr> {
    let pool_id = id.to_pool_id().ok_or(Status::EInval)?;
    runtime().fibers.with(pool_id, |e| e.attr).map_err(|_| Status::EInval)
}

/// Delivers any wakeups that were suppressed by a fiber's
/// `NO_SIGNAL` flag. Call this after a burst of `NO_SIGNAL` starts to
/// make sure the newly enqueued work actually gets picked up promptly.
pub fn flush() {
    let group = &runtime().group;
    for index in 0..group.concurrency() {
        let seat = group.seat(index);
        if !seat.local.is_empty() || !seat.remote.is_empty() {
            group.signal_task(1);
        }
    }
}

/// The number of worker threads currently running fibers.
pub fn get_concurrency() -> usize {
    runtime().group.concurrency()
}

/// Grows the worker pool to `n` threads. Only growth is supported;
/// returns [`Status::EInval`] if `n` is not greater than the current
/// count or exceeds the configured maximum.
pub fn set_concurrency(n: usize) -> FiberResult<()> {
    runtime().group.grow_to(n)
}

/// Creates a waitable event with the given initial value.
pub fn event_create(initial: u32) -> EventHandle {
    event::create(initial)
}

/// Destroys an event, waking any remaining waiters with
/// [`Status::EIntr`].
pub fn event_destroy(handle: EventHandle) -> FiberResult<()> {
    event::destroy(handle)
}

/// Blocks until the event's value no longer equals `expected`, a
/// matching wake call claims the waiter, `timeout` elapses, or the
/// caller is interrupted.
pub fn event_wait(handle: EventHandle, expected: u32, timeout: Option<Duration>) -> FiberResult<()> {
    event::wait(handle, expected, timeout)
}

/// Wakes at most one waiter; returns the number actually woken.
pub fn event_wake_one(handle: EventHandle) -> FiberResult<u32> {
    event::wake_one(handle)
}

/// Wakes every waiter currently queued on the event.
pub fn event_wake_all(handle: EventHandle) -> FiberResult<u32> {
    event::wake_all(handle)
}

/// Wakes every waiter except `except`.
pub fn event_wake_except(handle: EventHandle, except: FiberId) -> FiberResult<u32> {
    event::wake_except(handle, except)
}

/// Wakes up to `wake_count` waiters on `from`, then moves up to
/// `max_requeue` of the rest onto `to`.
pub fn event_requeue(from: EventHandle, to: EventHandle, wake_count: u32, max_requeue: u32) -> FiberResult<u32> {
    event::requeue(from, to, wake_count, max_requeue)
}

/// Reads an event's current value.
pub fn event_get_value(handle: EventHandle) -> FiberResult<u32> {
    event::get_value(handle)
}

/// Overwrites an event's value without waking anyone.
pub fn event_set_value(handle: EventHandle, value: u32) -> FiberResult<()> {
    event::set_value(handle, value)
}

/// Blocks the calling fiber until `fd` becomes readable.
pub fn fd_wait(fd: RawFd) -> FiberResult<()> {
    io::fd_wait(fd, false, None)
}

/// Blocks the calling fiber until `fd` becomes writable.
pub fn fd_wait_writable(fd: RawFd) -> FiberResult<()> {
    io::fd_wait(fd, true, None)
}

/// Like [`fd_wait`], but gives up after `timeout`.
pub fn fd_timedwait(fd: RawFd, timeout: Duration) -> FiberResult<()> {
    io::fd_wait(fd, false, Some(timeout))
}

/// Deregisters `fd`, closes it, and wakes any fiber parked in
/// [`fd_wait`]/[`fd_timedwait`] on it with success. Returns
/// [`Status::EBadF`] if `fd` has no live registration (never waited on,
/// or already closed).
pub fn fd_close(fd: RawFd) -> FiberResult<()> {
    io::fd_close(fd)
}

/// Schedules `callback` to run on the timer thread after `delay`.
pub fn timer_add(delay: Duration, callback: impl FnOnce() + Send + 'static) -> FiberResult<TimerId> {
    runtime().timers.schedule(std::time::Instant::now() + delay, Box::new(callback))
}

/// Cancels a previously scheduled timer.
pub fn timer_del(id: TimerId) -> FiberResult<()> {
    runtime().timers.unschedule(id)
}
