use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// A fast, non-cryptographic PRNG used only to pick a random victim
/// worker for work-stealing and a random worker for remote dispatch
/// from non-worker threads.
///
/// The seed is derived from `RandomState` rather than a hand-rolled
/// entropy source — stdlib already provides one, no need to build a
/// random-number facade just for picking a steal victim.
pub struct XorShift64 {
    state: Cell<u64>,
}

impl XorShift64 {
    /// A fixed, non-random seed; useful for reproducible tests.
    pub const fn fixed() -> Self {
        Self { state: Cell::new(0x2545_F491_4F6C_DD1D) }
    }

    /// A seed derived from `RandomState`, distinct per call site and
    /// per process run.
    pub fn random_state() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
        let seed = hasher.finish() | 1;
        Self { state: Cell::new(seed) }
    }

    /// Advances the generator and returns the next value.
    #[inline]
    pub fn next(&self) -> u64 {
        let mut x = self.state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Returns a value in `0..n`. Panics if `n == 0`.
    #[inline]
    pub fn next_usize(&self, n: usize) -> usize {
        assert!(n > 0);
        (self.next() % n as u64) as usize
    }
}

impl Default for XorShift64 {
    fn default() -> Self {
        Self::random_state()
    }
}

#[cfg(test)]
mod tests {
    use super::XorShift64;

    #[test]
    fn next_usize_is_in_bounds() {
        let rng = XorShift64::fixed();
        for _ in 0..1000 {
            assert!(rng.next_usize(7) < 7);
        }
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let a = XorShift64::fixed();
        let b = XorShift64::fixed();
        for _ in 0..16 {
            assert_eq!(a.next(), b.next());
        }
    }
}
