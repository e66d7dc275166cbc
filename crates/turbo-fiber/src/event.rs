//! The futex-style waitable event: `wait`/`wake_one`/`wake_all`/
//! `wake_except`/`requeue` over a value word and a queue of waiters.
//! Waiter state lives on the fiber entity itself rather than as a
//! separately allocated intrusive list node; the queue here only
//! needs to hold enough to find that entity again.
//!
//! `WaitableEvent`s are allocated from a pool that never frees slot
//! memory (see [`turbo_sync::Pool`]'s doc comment): a thread waking a
//! waiter reads that waiter's fields concurrently with whatever thread
//! eventually destroys the event, and destroying the backing memory
//! instead of just recycling the slot would turn that race into a
//! use-after-free.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use turbo_sync::{Pool, SpinLock};

use crate::entity::{WaitState, WaiterOutcome};
use crate::error::Status;
use crate::id::FiberId;
use crate::runtime::runtime;
use crate::stack::SwitchReason;
use crate::worker;

/// A handle to a [`WaitableEvent`] allocated from the runtime's event
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

impl EventHandle {
    fn from_pool_id(id: turbo_sync::PoolId) -> Self {
        Self(id.into_raw())
    }

    fn to_pool_id(self) -> turbo_sync::PoolId {
        turbo_sync::PoolId::from_raw(self.0)
    }
}

/// A non-fiber (or `pthread`-kind fiber) caller blocked on a
/// [`Condvar`](std::sync::Condvar) while waiting on an event. Fiber
/// waiters never allocate one of these; they suspend instead.
struct BlockingWaiter {
    outcome: std::sync::Mutex<Option<WaiterOutcome>>,
    condvar: std::sync::Condvar,
}

impl BlockingWaiter {
    fn new() -> Self {
        Self { outcome: std::sync::Mutex::new(None), condvar: std::sync::Condvar::new() }
    }

    fn signal(&self, outcome: WaiterOutcome) -> bool {
        let mut guard = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(outcome);
        self.condvar.notify_all();
        true
    }

    fn wait(&self) -> WaiterOutcome {
        let guard = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        let guard = self
            .condvar
            .wait_while(guard, |o| o.is_none())
            .unwrap_or_else(|e| e.into_inner());
        guard.expect("condvar woke with no outcome set")
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<WaiterOutcome> {
        let guard = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |o| o.is_none())
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

enum Waiter {
    Fiber(FiberId),
    Blocking(Arc<BlockingWaiter>),
}

struct Inner {
    value: u32,
    waiters: VecDeque<Waiter>,
}

/// A futex-style 32-bit word with an associated waiter queue.
pub struct WaitableEvent {
    inner: SpinLock<Inner>,
}

/// The process-wide event pool. Events never shrink the pool's
/// backing storage; see the module doc comment.
pub(crate) type EventPool = Pool<Arc<WaitableEvent>>;

pub(crate) fn new_pool() -> EventPool {
    Pool::new()
}

fn get_event(handle: EventHandle) -> Result<Arc<WaitableEvent>, Status> {
    runtime()
        .events
        .with(handle.to_pool_id(), |event| event.clone())
        .map_err(|_| Status::EInval)
}

/// Creates a new event with the given initial value.
pub fn create(initial: u32) -> EventHandle {
    let event = Arc::new(WaitableEvent {
        inner: SpinLock::new(Inner { value: initial, waiters: VecDeque::new() }),
    });
    EventHandle::from_pool_id(runtime().events.acquire(event))
}

/// Destroys an event, waking any remaining waiters with
/// [`Status::EIntr`].
pub fn destroy(handle: EventHandle) -> Result<(), Status> {
    let event = runtime()
        .events
        .release(handle.to_pool_id())
        .map_err(|_| Status::EInval)?;
    drain_wake(&event, WaiterOutcome::Interrupted);
    Ok(())
}

/// Reads the event's current value.
pub fn get_value(handle: EventHandle) -> Result<u32, Status> {
    let event = get_event(handle)?;
    let value = event.inner.lock().value;
    Ok(value)
}

/// Overwrites the event's value. Callers that want waiters to observe
/// the new value must follow this with a `wake_*` call: this function
/// does not wake anyone by itself, keeping the mutation separate from
/// the decision of who to signal.
pub fn set_value(handle: EventHandle, value: u32) -> Result<(), Status> {
    let event = get_event(handle)?;
    event.inner.lock().value = value;
    Ok(())
}

fn claim_fiber_waiter(fiber_id: FiberId, outcome: WaiterOutcome, direct_handoff: bool) -> bool {
    let Some(pool_id) = fiber_id.to_pool_id() else { return false };
    let claimed = runtime()
        .fibers
        .with_mut(pool_id, |entity| match &mut entity.wait_state {
            WaitState::Event { outcome: current, timer, .. } if *current == WaiterOutcome::Pending => {
                *current = outcome;
                timer.take()
            }
            _ => None,
        })
        .unwrap_or(None);

    let Some(timer_id) = claimed else { return false };
    let _ = runtime().timers.unschedule(timer_id);
    if direct_handoff && worker::is_worker_thread() {
        worker::exchange_hint(fiber_id);
    } else {
        worker::enqueue(fiber_id, false);
    }
    true
}

fn wake_waiter(waiter: Waiter, outcome: WaiterOutcome, direct_handoff: bool) -> bool {
    match waiter {
        Waiter::Blocking(w) => w.signal(outcome),
        Waiter::Fiber(fid) => claim_fiber_waiter(fid, outcome, direct_handoff),
    }
}

fn wake_n(event: &Arc<WaitableEvent>, mut n: usize, outcome: WaiterOutcome, direct_handoff: bool) -> u32 {
    let mut woken = 0u32;
    while n > 0 {
        let waiter = {
            let mut inner = event.inner.lock();
            inner.waiters.pop_front()
        };
        let Some(waiter) = waiter else { break };
        if wake_waiter(waiter, outcome, direct_handoff) {
            woken += 1;
            n -= 1;
        }
    }
    woken
}

fn drain_wake(event: &Arc<WaitableEvent>, outcome: WaiterOutcome) -> u32 {
    let mut woken = 0u32;
    loop {
        let waiter = {
            let mut inner = event.inner.lock();
            inner.waiters.pop_front()
        };
        let Some(waiter) = waiter else { break };
        if wake_waiter(waiter, outcome, false) {
            woken += 1;
        }
    }
    woken
}

/// Wakes at most one waiter. Returns the number actually woken (`0` or
/// `1`; stale, already-timed-out-or-interrupted entries are skipped
/// without counting).
///
/// When called from a worker thread, the woken fiber is handed
/// straight to that worker's local queue (`worker::exchange_hint`)
/// instead of going through the generic random-dispatch `enqueue`, so
/// it gets a chance to run without waiting on a steal.
pub fn wake_one(handle: EventHandle) -> Result<u32, Status> {
    let event = get_event(handle)?;
    Ok(wake_n(&event, 1, WaiterOutcome::Ready, true))
}

/// Wakes every waiter currently queued on the event.
pub fn wake_all(handle: EventHandle) -> Result<u32, Status> {
    let event = get_event(handle)?;
    Ok(drain_wake(&event, WaiterOutcome::Ready))
}

/// Wakes every waiter except `except`, leaving it queued.
pub fn wake_except(handle: EventHandle, except: FiberId) -> Result<u32, Status> {
    let event = get_event(handle)?;
    let mut kept = VecDeque::new();
    let mut woken = 0u32;
    loop {
        let waiter = {
            let mut inner = event.inner.lock();
            inner.waiters.pop_front()
        };
        let Some(waiter) = waiter else { break };
        match waiter {
            Waiter::Fiber(fid) if fid == except => kept.push_back(Waiter::Fiber(fid)),
            other => {
                if wake_waiter(other, WaiterOutcome::Ready, false) {
                    woken += 1;
                }
            }
        }
    }
    if !kept.is_empty() {
        let mut inner = event.inner.lock();
        inner.waiters.extend(kept);
    }
    Ok(woken)
}

/// Wakes up to `wake_count` waiters on `from`, then moves up to
/// `max_requeue` of the remaining waiters onto `to` without waking
/// them. Returns the number actually woken.
///
/// Each step locks at most one event at a time, so unlike the original
/// this never needs a canonical lock ordering between `from` and `to`
/// to avoid deadlocking against a concurrent requeue in the opposite
/// direction.
pub fn requeue(from: EventHandle, to: EventHandle, wake_count: u32, max_requeue: u32) -> Result<u32, Status> {
    let event_from = get_event(from)?;
    let event_to = get_event(to)?;

    let woken = wake_n(&event_from, wake_count as usize, WaiterOutcome::Ready, false);

    let mut moved = 0u32;
    while moved < max_requeue {
        let waiter = {
            let mut inner = event_from.inner.lock();
            inner.waiters.pop_front()
        };
        let Some(waiter) = waiter else { break };

        if let Waiter::Fiber(fid) = &waiter {
            if let Some(pool_id) = fid.to_pool_id() {
                let _ = runtime().fibers.with_mut(pool_id, |entity| {
                    if let WaitState::Event { event, .. } = &mut entity.wait_state {
                        *event = to;
                    }
                });
            }
        }

        event_to.inner.lock().waiters.push_back(waiter);
        moved += 1;
    }

    Ok(woken)
}

fn on_timeout(fiber_id: FiberId) {
    claim_fiber_waiter(fiber_id, WaiterOutcome::TimedOut, false);
}

/// Forces a waiting fiber's wait to resolve as interrupted. Used by
/// `interrupt()`. No-op if the fiber isn't currently waiting on an
/// event (it may be asleep, running, or idle).
pub(crate) fn force_interrupt(fiber_id: FiberId) -> bool {
    claim_fiber_waiter(fiber_id, WaiterOutcome::Interrupted, false)
}

/// Blocks the caller until the event's value no longer equals
/// `expected`, a matching `wake_*` call claims it, `timeout` elapses,
/// or the caller is interrupted.
///
/// If the value already differs from `expected` this returns
/// immediately with [`Status::EWouldBlock`], matching the classic
/// futex contract: the check and the enqueue of the waiter happen
/// under the same lock, so a value change can never be missed between
/// the two.
pub fn wait(handle: EventHandle, expected: u32, timeout: Option<Duration>) -> Result<(), Status> {
    let event = get_event(handle)?;

    let is_fiber = worker::current_fiber_id().is_some();
    if is_fiber {
        wait_as_fiber(handle, &event, expected, timeout)
    } else {
        wait_blocking(&event, expected, timeout)
    }
}

fn wait_as_fiber(
    handle: EventHandle,
    event: &Arc<WaitableEvent>,
    expected: u32,
    timeout: Option<Duration>,
) -> Result<(), Status> {
    {
        let inner = event.inner.lock();
        if inner.value != expected {
            return Err(Status::EWouldBlock);
        }
    }

    let fiber_id = worker::current_fiber_id().ok_or(Status::EInval)?;
    let deadline = timeout.map(|d| Instant::now() + d);
    let event_for_remained = event.clone();

    let remained: worker::RemainedFn = Box::new(move || {
        {
            let mut inner = event_for_remained.inner.lock();
            inner.waiters.push_back(Waiter::Fiber(fiber_id));
        }

        let timer = deadline.and_then(|deadline| {
            runtime()
                .timers
                .schedule(deadline, Box::new(move || on_timeout(fiber_id)))
                .ok()
        });

        if let Some(pool_id) = fiber_id.to_pool_id() {
            let _ = runtime().fibers.with_mut(pool_id, |entity| {
                entity.wait_state = WaitState::Event { event: handle, expected, timer, outcome: WaiterOutcome::Pending };
            });
        }
    });

    worker::block_current(SwitchReason::WaitingOnEvent, remained)?;

    let outcome = fiber_id
        .to_pool_id()
        .and_then(|pool_id| {
            runtime()
                .fibers
                .with_mut(pool_id, |entity| match std::mem::replace(&mut entity.wait_state, WaitState::Idle) {
                    WaitState::Event { outcome, .. } => outcome,
                    _ => WaiterOutcome::Ready,
                })
                .ok()
        })
        .unwrap_or(WaiterOutcome::Ready);

    outcome_to_result(outcome)
}

fn wait_blocking(event: &Arc<WaitableEvent>, expected: u32, timeout: Option<Duration>) -> Result<(), Status> {
    let waiter = Arc::new(BlockingWaiter::new());
    {
        let mut inner = event.inner.lock();
        if inner.value != expected {
            return Err(Status::EWouldBlock);
        }
        inner.waiters.push_back(Waiter::Blocking(waiter.clone()));
    }

    let outcome = match timeout {
        Some(timeout) => waiter.wait_timeout(timeout).unwrap_or(WaiterOutcome::TimedOut),
        None => waiter.wait(),
    };

    outcome_to_result(outcome)
}

fn outcome_to_result(outcome: WaiterOutcome) -> Result<(), Status> {
    match outcome {
        WaiterOutcome::Ready | WaiterOutcome::Pending => Ok(()),
        WaiterOutcome::TimedOut => Err(Status::ETimedOut),
        WaiterOutcome::Interrupted => Err(Status::EIntr),
        WaiterOutcome::Closed => Err(Status::EBadF),
        WaiterOutcome::Unmatched => Err(Status::EWouldBlock),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::runtime;

    #[test]
    fn wait_on_unmatched_value_is_immediate() {
        let _ = runtime();
        let handle = create(5);
        let err = wait(handle, 9, None).unwrap_err();
        assert_eq!(err, Status::EWouldBlock);
        destroy(handle).unwrap();
    }

    #[test]
    fn wake_one_with_no_waiters_is_zero() {
        let _ = runtime();
        let handle = create(0);
        assert_eq!(wake_one(handle).unwrap(), 0);
        destroy(handle).unwrap();
    }

    #[test]
    fn blocking_wait_wakes_on_wake_one() {
        let _ = runtime();
        let handle = create(0);
        let waiter = std::thread::spawn(move || wait(handle, 0, None));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(wake_one(handle).unwrap(), 1);
        assert!(waiter.join().unwrap().is_ok());
        destroy(handle).unwrap();
    }

    #[test]
    fn blocking_wait_times_out() {
        let _ = runtime();
        let handle = create(0);
        let err = wait(handle, 0, Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err, Status::ETimedOut);
        destroy(handle).unwrap();
    }
}
