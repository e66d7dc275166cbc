use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::Backoff;

/// A user-space spinlock with no associated data.
///
/// This is the primitive that [`crate::SpinLock`] is built on. It is
/// useful on its own when the protected state is a `Cell` or other
/// `!Sync` type that the caller wants to guard without paying for an
/// `UnsafeCell` wrapper here too.
pub struct Futex {
    state: AtomicBool,
}

impl Futex {
    /// Creates an unlocked `Futex`.
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }

    /// Returns `true` if the futex is currently locked.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.state.load(Acquire)
    }

    /// Tries to lock `self` without blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state.compare_exchange(false, true, Acquire, Relaxed).is_ok()
    }

    /// Locks `self`, busy-waiting with a tight spin loop.
    #[inline]
    pub fn quick_lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            while self.state.load(Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    /// Locks `self`, backing off exponentially between attempts.
    #[inline]
    pub fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            if self.try_lock() {
                return;
            }
            while self.state.load(Relaxed) {
                backoff.spin();
            }
        }
    }

    /// Unlocks `self` unconditionally.
    #[inline(always)]
    pub fn unlock(&self) {
        self.state.store(false, Release);
    }
}

impl Default for Futex {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// An RAII scoped lock of a [`Futex`].
pub struct FutexGuard<'a> {
    futex: &'a Futex,
}

impl<'a> FutexGuard<'a> {
    /// Wraps an already-locked futex so it unlocks on drop.
    #[inline(always)]
    pub const fn new(futex: &'a Futex) -> FutexGuard<'a> {
        FutexGuard { futex }
    }
}

impl Drop for FutexGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.futex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::Futex;

    #[test]
    fn lock_unlock_roundtrip() {
        let futex = Futex::new();
        assert!(!futex.is_locked());
        futex.lock();
        assert!(futex.is_locked());
        assert!(!futex.try_lock());
        futex.unlock();
        assert!(!futex.is_locked());
        assert!(futex.try_lock());
    }
}
