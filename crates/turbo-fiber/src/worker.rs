//! A pthread-bound executor: owns a local work-stealing queue and a
//! remote MPSC queue, drives the run loop, and carries the "remained
//! callback" that several operations defer to just after a context
//! switch starts.
//!
//! The run loop shape (local queue, then steal a peer, then park) is
//! the same one an async executor uses polling a `Future`, generalized
//! here to switch a stackful fiber via `corosensei::resume` instead.
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use corosensei::CoroutineResult;

use turbo_sync::{ArrayQueue, SpinLock};

use crate::attr::{Attr, StackKind};
use crate::entity::FiberEntity;
use crate::error::Status;
use crate::id::FiberId;
use crate::runtime::runtime;
use crate::stack::SwitchReason;
use crate::xor_shift::XorShift64;

/// Work deferred until just after a context switch has started,
/// because the fiber being switched away from cannot safely touch its
/// own state mid-switch: e.g. pushing itself onto an event's waiter
/// list only after it has fully suspended, never before.
pub(crate) type RemainedFn = Box<dyn FnOnce()>;

/// Per-worker scheduling counters.
#[derive(Default)]
pub(crate) struct Counters {
    pub nswitch: AtomicUsize,
    pub nsignaled: AtomicUsize,
    pub num_nosignal: AtomicUsize,
    pub remote_nsignaled: AtomicUsize,
    pub remote_num_nosignal: AtomicUsize,
}

/// A worker's shared state: the parts stealers and remote producers
/// on other threads must be able to reach (a fixed array of these
/// lives in `ScheduleGroup`).
pub(crate) struct Seat {
    pub local: ArrayQueue<FiberId>,
    pub remote: ArrayQueue<FiberId>,
    pub remote_lock: SpinLock<()>,
    pub parking_index: usize,
    pub counters: Counters,
}

impl Seat {
    pub fn new(local_capacity: usize, remote_capacity: usize, parking_index: usize) -> Self {
        Self {
            local: ArrayQueue::new(local_capacity),
            remote: ArrayQueue::new(remote_capacity),
            remote_lock: SpinLock::new(()),
            parking_index,
            counters: Counters::default(),
        }
    }

    /// Pushes onto the remote queue, retrying with a short sleep if
    /// full.
    pub fn push_remote(&self, fiber: FiberId) {
        loop {
            let _guard = self.remote_lock.lock();
            match self.remote.push(fiber) {
                Ok(()) => return,
                Err(_) => {
                    drop(_guard);
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

/// Per-thread worker state only the owning thread touches.
struct WorkerLocal {
    seat_index: usize,
    current: Cell<FiberId>,
    remained: RefCell<Option<RemainedFn>>,
    rng: XorShift64,
}

thread_local! {
    static LOCAL: RefCell<Option<WorkerLocal>> = const { RefCell::new(None) };
}

/// Returns `true` if the calling OS thread is a fiber worker.
pub(crate) fn is_worker_thread() -> bool {
    LOCAL.with(|local| local.borrow().is_some())
}

/// Returns the fiber currently running on this worker thread, if any.
pub(crate) fn current_fiber_id() -> Option<FiberId> {
    LOCAL.with(|local| {
        local.borrow().as_ref().and_then(|w| {
            let id = w.current.get();
            if id.is_none() { None } else { Some(id) }
        })
    })
}

fn seat_index() -> Option<usize> {
    LOCAL.with(|local| local.borrow().as_ref().map(|w| w.seat_index))
}

/// Arms the remained callback for the current worker. Must be called
/// from inside a fiber body, immediately before yielding.
pub(crate) fn set_remained(f: RemainedFn) {
    LOCAL.with(|local| {
        if let Some(w) = local.borrow().as_ref() {
            *w.remained.borrow_mut() = Some(f);
        }
    });
}

/// Picks a uniformly random seat index, for remote dispatch from
/// non-worker threads and as the starting point of a steal scan.
pub(crate) fn random_seat_index() -> usize {
    LOCAL.with(|local| {
        let borrow = local.borrow();
        let count = runtime().group.concurrency();
        match borrow.as_ref() {
            Some(w) => w.rng.next_usize(count),
            None => XorShift64::random_state().next_usize(count),
        }
    })
}

/// Enqueues a fiber: onto the current worker's local queue if called
/// from a worker, otherwise onto a randomly chosen worker's remote
/// queue. `nosignal` suppresses the parking-lot wake, so a caller
/// enqueuing many fibers at once can signal just once at the end.
pub(crate) fn enqueue(fiber: FiberId, nosignal: bool) {
    let group = &runtime().group;
    match seat_index() {
        Some(index) => {
            let seat = group.seat(index);
            if seat.local.push(fiber).is_err() {
                seat.push_remote(fiber);
            }
            if nosignal {
                seat.counters.num_nosignal.fetch_add(1, Ordering::Relaxed);
            } else {
                seat.counters.nsignaled.fetch_add(1, Ordering::Relaxed);
                group.signal_task(1);
            }
        }
        None => {
            let index = random_seat_index();
            let seat = group.seat(index);
            seat.push_remote(fiber);
            if nosignal {
                seat.counters.remote_num_nosignal.fetch_add(1, Ordering::Relaxed);
            } else {
                seat.counters.remote_nsignaled.fetch_add(1, Ordering::Relaxed);
                group.signal_task(1);
            }
        }
    }
}

/// Hands `fiber` directly to the current worker's local queue, used by
/// `wake_one` when waking from inside a worker so the woken fiber gets
/// a chance to run without waiting on a steal.
pub(crate) fn exchange_hint(fiber: FiberId) {
    enqueue(fiber, false);
}

/// Suspends the current fiber, running `remained` on the worker
/// thread immediately after the switch away completes.
///
/// Must only be called from inside a fiber body running on a
/// `Coroutine`-backed stack; panics otherwise (a `pthread`-kind fiber
/// has no stack to switch away from — callers must check
/// `Attr::stack_kind` first and block the OS thread directly instead).
pub(crate) fn suspend_current(reason: SwitchReason, remained: RemainedFn) {
    set_remained(remained);
    CURRENT_YIELDER.with(|cell| {
        let ptr = cell.get();
        assert!(!ptr.is_null(), "suspend_current called outside a fiber coroutine");
        let yielder = unsafe { &*(ptr as *const crate::stack::FiberYielder) };
        yielder.suspend(reason);
    });
}

thread_local! {
    static CURRENT_YIELDER: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

/// Runs `f` with the current fiber's yielder installed, for the
/// duration of one coroutine resume. Called only from the worker run
/// loop's trampoline closure.
fn with_yielder_installed<R>(yielder: &crate::stack::FiberYielder, f: impl FnOnce() -> R) -> R {
    CURRENT_YIELDER.with(|cell| {
        let previous = cell.get();
        cell.set(yielder as *const _ as *const ());
        let result = f();
        cell.set(previous);
        result
    })
}

/// Starts a worker OS thread bound to `seat_index` and runs it until
/// the schedule group stops.
pub(crate) fn spawn_worker_thread(seat_index: usize) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("turbo-fiber-worker-{seat_index}"))
        .spawn(move || run(seat_index))
        .expect("failed to spawn fiber worker thread")
}

fn run(seat_index: usize) {
    LOCAL.with(|local| {
        *local.borrow_mut() = Some(WorkerLocal {
            seat_index,
            current: Cell::new(FiberId::NONE),
            remained: RefCell::new(None),
            rng: XorShift64::random_state(),
        });
    });

    let group = &runtime().group;
    let parking_index = group.seat(seat_index).parking_index;

    loop {
        let next = pop_local(seat_index)
            .or_else(|| group.steal_into(seat_index))
            .or_else(|| pop_remote(seat_index));

        let Some(fiber_id) = next else {
            if group.is_stopped() {
                return;
            }
            let state = group.parking_lot(parking_index).get_state();
            if group.has_work(seat_index) {
                continue;
            }
            group.parking_lot(parking_index).wait_timeout(state, Duration::from_millis(50));
            continue;
        };

        run_fiber(fiber_id);

        LOCAL.with(|local| {
            if let Some(w) = local.borrow().as_ref() {
                if let Some(remained) = w.remained.borrow_mut().take() {
                    remained();
                }
            }
        });
    }
}

fn pop_local(seat_index: usize) -> Option<FiberId> {
    runtime().group.seat(seat_index).local.pop()
}

fn pop_remote(seat_index: usize) -> Option<FiberId> {
    runtime().group.seat(seat_index).remote.pop()
}

fn run_fiber(fiber_id: FiberId) {
    LOCAL.with(|local| {
        if let Some(w) = local.borrow().as_ref() {
            w.current.set(fiber_id);
        }
    });

    let fibers = &runtime().fibers;
    let Some(pool_id) = fiber_id.to_pool_id() else { return };

    let attr = fibers.with(pool_id, |e: &FiberEntity| e.attr).unwrap_or_default();
    let is_first_run = fibers.with(pool_id, |e: &FiberEntity| e.cpuwide_start_ns == 0).unwrap_or(false);
    let _ = fibers.with_mut(pool_id, |e: &mut FiberEntity| {
        if e.cpuwide_start_ns == 0 {
            e.cpuwide_start_ns = now_ns();
        }
    });
    if is_first_run && attr.log_start_finish() {
        tracing::info_span!("fiber", id = ?fiber_id).in_scope(|| tracing::info!("start"));
    }
    if attr.log_switch() {
        tracing::trace!(?fiber_id, "switch in");
    }

    if attr.stack_kind == StackKind::Pthread {
        run_pthread_fiber(pool_id, fiber_id);
    } else {
        run_coroutine_fiber(pool_id, fiber_id);
    }

    if attr.log_switch() {
        tracing::trace!(?fiber_id, "switch out");
    }

    LOCAL.with(|local| {
        if let Some(w) = local.borrow().as_ref() {
            w.current.set(FiberId::NONE);
        }
    });
}

fn run_pthread_fiber(pool_id: turbo_sync::PoolId, fiber_id: FiberId) {
    let fibers = &runtime().fibers;
    let body = fibers.with_mut(pool_id, |e: &mut FiberEntity| e.body.take()).ok().flatten();
    if let Some(body) = body {
        let start = Instant::now();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        record_cputime(pool_id, start.elapsed());
        if let Err(payload) = outcome {
            if payload.downcast_ref::<crate::FiberExit>().is_none() {
                tracing::error!(?fiber_id, "fiber panicked on a pthread-kind stack, aborting");
                std::process::abort();
            }
        }
    }
    finish_fiber(pool_id, fiber_id);
}

fn run_coroutine_fiber(pool_id: turbo_sync::PoolId, fiber_id: FiberId) {
    let fibers = &runtime().fibers;
    let needs_start = fibers.with(pool_id, |e: &FiberEntity| e.stack.is_none()).unwrap_or(true);

    if needs_start {
        let body = fibers.with_mut(pool_id, |e: &mut FiberEntity| e.body.take()).ok().flatten();
        let Some(body) = body else { return finish_fiber(pool_id, fiber_id) };
        let kind = fibers.with(pool_id, |e: &FiberEntity| e.attr.stack_kind).unwrap_or_default();

        let stack = runtime().stacks.spawn(kind, move |yielder| {
            with_yielder_installed(yielder, || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
                if let Err(payload) = result {
                    if payload.downcast_ref::<crate::FiberExit>().is_none() {
                        tracing::error!(?fiber_id, "fiber panicked, aborting");
                        std::process::abort();
                    }
                }
            });
        });

        match stack {
            Ok(stack) => {
                let _ = fibers.with_mut(pool_id, |e: &mut FiberEntity| e.stack = Some(stack));
            }
            Err(_) => {
                tracing::error!(?fiber_id, "failed to allocate a stack, dropping fiber");
                return finish_fiber(pool_id, fiber_id);
            }
        }
    }

    // The stack is checked out of the entity for the duration of the
    // resume: holding the pool's lock across a fiber's entire run
    // would serialize every other thread's access to every other
    // fiber's entity on this one spinlock.
    let mut stack = match fibers.with_mut(pool_id, |e: &mut FiberEntity| e.stack.take()) {
        Ok(Some(stack)) => stack,
        _ => return finish_fiber(pool_id, fiber_id),
    };

    let start = Instant::now();
    let result = with_yielder_context(&mut stack);
    record_cputime(pool_id, start.elapsed());

    if matches!(result, CoroutineResult::Yield(_)) {
        let _ = fibers.with_mut(pool_id, |e: &mut FiberEntity| e.stack = Some(stack));
    } else {
        runtime().stacks.reclaim(stack);
    }

    match result {
        CoroutineResult::Yield(_reason) => {
            // The fiber arranged its own re-enqueue / wait registration
            // via `suspend_current`'s `remained` closure; nothing to do.
        }
        CoroutineResult::Return(()) => {
            finish_fiber(pool_id, fiber_id);
        }
    }
}

fn with_yielder_context(stack: &mut crate::stack::FiberStack) -> CoroutineResult<SwitchReason, ()> {
    stack.resume()
}

fn now_ns() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn record_cputime(pool_id: turbo_sync::PoolId, elapsed: Duration) {
    let _ = runtime().fibers.with_mut(pool_id, |e: &mut FiberEntity| {
        e.stats.cputime_ns += elapsed.as_nanos() as u64;
        e.stats.nswitch += 1;
    });
}

fn finish_fiber(pool_id: turbo_sync::PoolId, fiber_id: FiberId) {
    let fibers = &runtime().fibers;
    let log_start_finish = fibers.with(pool_id, |e: &FiberEntity| e.attr.log_start_finish()).unwrap_or(false);
    let completion = fibers.with_mut(pool_id, |e: &mut FiberEntity| {
        e.about_to_quit = true;
        e.completion.clone()
    });

    if let Ok(completion) = completion {
        completion.mark_done();
    }

    let _ = fibers.release(pool_id);

    if log_start_finish {
        tracing::info_span!("fiber", id = ?fiber_id).in_scope(|| tracing::info!("finish"));
    }
}

/// Creates a fresh fiber entity and enqueues it, without preempting
/// the caller. Used by both `start_background` and `start_urgent`'s
/// non-preempting half.
pub(crate) fn spawn(attr: Attr, name: Option<Box<str>>, body: crate::entity::FiberBody) -> FiberId {
    let entity = FiberEntity::new(attr, name, body);
    let pool_id = runtime().fibers.acquire(entity);
    let fiber_id = FiberId::from_pool_id(pool_id);
    let _ = runtime().fibers.with_mut(pool_id, |e: &mut FiberEntity| e.id = fiber_id);
    enqueue(fiber_id, attr.nosignal());
    fiber_id
}

/// Implements `yield_now`: push the current fiber back onto its
/// worker's local queue and switch away.
pub(crate) fn yield_now() {
    let Some(fiber_id) = current_fiber_id() else { return };
    if !is_pthread_current() {
        suspend_current(SwitchReason::Yielded, Box::new(move || enqueue(fiber_id, false)));
    }
}

fn is_pthread_current() -> bool {
    current_fiber_id()
        .and_then(|id| id.to_pool_id())
        .and_then(|pool_id| runtime().fibers.with(pool_id, |e: &FiberEntity| e.attr.stack_kind).ok())
        .map(|kind| kind == StackKind::Pthread)
        .unwrap_or(true)
}

pub(crate) fn block_current(reason: SwitchReason, remained: RemainedFn) -> Result<(), Status> {
    if current_fiber_id().is_none() {
        return Err(Status::EInval);
    }
    if is_pthread_current() {
        return Err(Status::EInval);
    }
    suspend_current(reason, remained);
    Ok(())
}
