//! Machine-context switching and per-size-class stack caches.
//!
//! The actual register-save/restore and stack-pointer swap is
//! `corosensei::Coroutine`; everything else here is free-list
//! bookkeeping layered on top, one bounded free list per stack size
//! class.
//!
//! `pthread`-kind fibers have no entry here at all: they run their
//! body inline on the worker's own call stack (see `worker::run`), so
//! there is nothing to allocate, switch to, or recycle.
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use turbo_sync::ArrayQueue;

use crate::attr::StackKind;
use crate::config::Config;
use crate::error::Status;

/// What a fiber yields with: the reason it is giving up the worker,
/// carried from inside the fiber body out to the driving `resume()`
/// call so the worker knows what "remained" work to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Yielded,
    Sleeping,
    WaitingOnEvent,
    WaitingOnFd,
}

pub(crate) type FiberCoroutine = Coroutine<(), SwitchReason, ()>;
pub(crate) type FiberYielder = Yielder<(), SwitchReason>;
pub(crate) type FiberCoroutineResult = CoroutineResult<SwitchReason, ()>;

/// A live, resumable stackful coroutine for one fiber run.
pub struct FiberStack {
    coroutine: FiberCoroutine,
    kind: StackKind,
}

// Safe per corosensei's `Coroutine` docs: manual `Send` is sound as long as
// everything captured on the coroutine's stack is `Send`. `FiberBody` is
// `Box<dyn FnOnce() + Send + 'static>` and `SwitchReason` is a plain `Copy`
// enum, so that holds here.
unsafe impl Send for FiberStack {}

impl FiberStack {
    pub fn kind(&self) -> StackKind {
        self.kind
    }

    pub fn resume(&mut self) -> FiberCoroutineResult {
        self.coroutine.resume(())
    }

    pub fn done(&self) -> bool {
        self.coroutine.done()
    }
}

/// Caches stacks per size class so that starting and finishing fibers
/// doesn't pay `mmap`/`munmap` on the hot path.
pub struct StackPool {
    small: ArrayQueue<DefaultStack>,
    normal: ArrayQueue<DefaultStack>,
    large: ArrayQueue<DefaultStack>,
}

impl StackPool {
    pub fn new() -> Self {
        let cap = Config::get().stack_freelist_cap;
        Self {
            small: ArrayQueue::new(cap),
            normal: ArrayQueue::new(cap),
            large: ArrayQueue::new(cap),
        }
    }

    fn freelist(&self, kind: StackKind) -> Option<&ArrayQueue<DefaultStack>> {
        match kind {
            StackKind::Small => Some(&self.small),
            StackKind::Normal => Some(&self.normal),
            StackKind::Large => Some(&self.large),
            StackKind::Main | StackKind::Pthread => None,
        }
    }

    fn stack_bytes(kind: StackKind) -> usize {
        let config = Config::get();
        match kind {
            StackKind::Small => config.small_stack_bytes,
            StackKind::Normal => config.normal_stack_bytes,
            StackKind::Large => config.large_stack_bytes,
            StackKind::Main | StackKind::Pthread => 0,
        }
    }

    fn acquire_raw(&self, kind: StackKind) -> Result<DefaultStack, Status> {
        if let Some(freelist) = self.freelist(kind) {
            if let Some(stack) = freelist.pop() {
                return Ok(stack);
            }
        }
        DefaultStack::new(Self::stack_bytes(kind)).map_err(|_| Status::ENoMem)
    }

    /// Builds a fresh coroutine of the given kind running `body`.
    ///
    /// `body` receives the yielder it must stash somewhere reachable
    /// (a thread-local, in this crate's case) before calling the
    /// user's fiber function, so that `yield_now`/`sleep`/`wait` can
    /// find their way back to it from arbitrary call depth.
    pub fn spawn(
        &self,
        kind: StackKind,
        body: impl FnOnce(&FiberYielder) + 'static,
    ) -> Result<FiberStack, Status> {
        let stack = self.acquire_raw(kind)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder, ()| {
            body(yielder);
        });
        Ok(FiberStack { coroutine, kind })
    }

    /// Returns a finished fiber's stack to its size class's free-list.
    ///
    /// If the free-list is full the stack is dropped (and its memory
    /// unmapped), the one place in this crate that does release
    /// memory back to the OS: C5's per-kind cache is explicitly
    /// bounded, unlike C1's slab.
    pub fn reclaim(&self, fiber_stack: FiberStack) {
        debug_assert!(fiber_stack.done());
        let kind = fiber_stack.kind;
        let stack = fiber_stack.coroutine.into_stack();
        if let Some(freelist) = self.freelist(kind) {
            let _ = freelist.push(stack);
        }
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{StackPool, SwitchReason};
    use crate::attr::StackKind;
    use corosensei::CoroutineResult;

    #[test]
    fn spawned_coroutine_runs_to_completion() {
        let pool = StackPool::new();
        let ran = std::rc::Rc::new(std::cell::Cell::new(false));
        let ran2 = ran.clone();
        let mut stack = pool.spawn(StackKind::Small, move |_yielder| {
            ran2.set(true);
        }).unwrap();

        match stack.resume() {
            CoroutineResult::Return(()) => {}
            CoroutineResult::Yield(_) => panic!("did not expect a yield"),
        }
        assert!(ran.get());
        assert!(stack.done());
        pool.reclaim(stack);
    }

    #[test]
    fn spawned_coroutine_can_yield_and_resume() {
        let pool = StackPool::new();
        let mut stack = pool.spawn(StackKind::Small, |yielder| {
            yielder.suspend(SwitchReason::Yielded);
        }).unwrap();

        match stack.resume() {
            CoroutineResult::Yield(SwitchReason::Yielded) => {}
            other => panic!("expected a yield, got {other:?}"),
        }
        match stack.resume() {
            CoroutineResult::Return(()) => {}
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
