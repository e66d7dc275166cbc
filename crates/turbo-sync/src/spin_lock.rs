use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{RefUnwindSafe, UnwindSafe};

use crate::Futex;

/// A mutual-exclusion primitive that busy-waits instead of parking the
/// thread with the OS.
///
/// Used for the short, uncontended critical sections inside the
/// scheduler (queue heads/tails, the waiter lists of a waitable
/// event) where the cost of a syscall would dwarf the cost of the
/// critical section itself.
pub struct SpinLock<T: ?Sized> {
    futex: Futex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
impl<T: ?Sized> UnwindSafe for SpinLock<T> {}
impl<T: ?Sized> RefUnwindSafe for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state.
    #[inline]
    pub const fn new(t: T) -> Self {
        SpinLock {
            futex: Futex::new(),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning with exponential backoff.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.futex.lock();
        SpinLockGuard { lock: self }
    }

    /// Acquires the lock with a tight spin, no backoff.
    ///
    /// Appropriate for critical sections so short that the backoff
    /// bookkeeping would cost more than a few extra spins.
    #[inline]
    pub fn quick_lock(&self) -> SpinLockGuard<'_, T> {
        self.futex.quick_lock();
        SpinLockGuard { lock: self }
    }

    /// Returns `true` if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.futex.is_locked()
    }

    /// Tries to acquire the lock without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.futex.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Consumes the lock, returning the protected value.
    #[inline(always)]
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the protected value.
    ///
    /// Requires `&mut self`, so no locking is necessary.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> From<T> for SpinLock<T> {
    #[inline]
    fn from(t: T) -> Self {
        SpinLock::new(t)
    }
}

impl<T: Default> Default for SpinLock<T> {
    #[inline]
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinLock");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                d.field("data", &format_args!("<locked>"));
            }
        }
        d.finish_non_exhaustive()
    }
}

/// An RAII scoped lock of a [`SpinLock`].
///
/// The lock is released when this guard is dropped.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}
impl<T: UnwindSafe + ?Sized> UnwindSafe for SpinLockGuard<'_, T> {}
impl<T: RefUnwindSafe + ?Sized> RefUnwindSafe for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.futex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn smoke() {
        let m = SpinLock::new(());
        drop(m.lock());
        drop(m.lock());
    }

    #[test]
    fn lots_and_lots() {
        const J: u32 = 1000;
        const K: u32 = 3;

        let m = Arc::new(SpinLock::new(0));

        fn inc(m: &SpinLock<u32>) {
            for _ in 0..J {
                *m.lock() += 1;
            }
        }

        thread::scope(|scope| {
            for _ in 0..K {
                scope.spawn(|| inc(&m));
                scope.spawn(|| inc(&m));
            }
        });

        assert_eq!(*m.lock(), J * K * 2);
    }

    #[test]
    fn try_lock_contends() {
        let m = SpinLock::new(1);
        let guard = m.lock();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn into_inner_and_get_mut() {
        let mut m = SpinLock::new(10);
        *m.get_mut() = 20;
        assert_eq!(m.into_inner(), 20);
    }
}
