use std::cell::Cell;
use std::fmt;

/// The maximum exponent of spin count.
const SPIN_LIMIT: u32 = 5;

/// Performs exponential backoff in spin loops.
///
/// Backing off in spin loops reduces contention and improves overall
/// throughput. Each step of the backoff takes roughly twice as long
/// as the previous one, until `snooze` starts yielding the thread to
/// the OS scheduler instead of spinning.
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    /// Creates a new `Backoff` at step zero.
    #[inline(always)]
    pub const fn new() -> Self {
        Self { step: Cell::new(0) }
    }

    /// Backs off in a lock-free loop.
    ///
    /// Use this when retrying an operation because another thread made
    /// progress, not because we're waiting on it.
    #[inline(always)]
    pub fn spin(&self) {
        let step: u32 = 1 << self.step.get();
        for _ in 0..step {
            std::hint::spin_loop();
        }

        if self.step.get() < SPIN_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Backs off while waiting on another thread to make progress.
    ///
    /// Once the spin count saturates, this yields the current thread
    /// instead of spinning further.
    #[inline]
    pub fn snooze(&self) {
        if self.step.get() < SPIN_LIMIT {
            let step: u32 = 1 << (self.step.get() << 1);

            for _ in 0..step {
                std::hint::spin_loop();
            }

            self.step.set(self.step.get() + 1);
        } else {
            std::thread::yield_now();
        }
    }

    /// Resets the backoff to step zero.
    #[inline(always)]
    pub fn reset(&self) {
        self.step.set(0);
    }

    /// Returns `true` once `snooze` would yield the thread rather than spin.
    #[inline(always)]
    pub fn is_completed(&self) -> bool {
        self.step.get() >= SPIN_LIMIT
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").field("step", &self.step).finish()
    }
}

impl Default for Backoff {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}
