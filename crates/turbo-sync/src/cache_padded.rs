use std::fmt;
use std::ops::{Deref, DerefMut};

/// Pads and aligns a value to the length of a cache line, to prevent
/// false sharing between values that are accessed by different
/// threads (e.g. a worker's head and tail indices).
///
/// Most modern x86-64 and ARM64 processors have 64-byte cache lines,
/// but Intel's newer processors sometimes prefetch two lines at once,
/// which effectively makes the line 128 bytes wide. We pad to 128
/// bytes everywhere to be safe rather than special-case every
/// architecture.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
#[repr(align(128))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Pads and aligns a value to the length of a cache line.
    pub const fn new(value: T) -> Self {
        CachePadded { value }
    }

    /// Returns the inner value, consuming the padded wrapper.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePadded").field("value", &self.value).finish()
    }
}

impl<T> From<T> for CachePadded<T> {
    fn from(t: T) -> Self {
        CachePadded::new(t)
    }
}

#[cfg(test)]
mod tests {
    use super::CachePadded;
    use std::mem::{align_of, size_of};

    #[test]
    fn padding_rounds_up_to_cache_line() {
        assert!(size_of::<CachePadded<u8>>() >= 128);
        assert_eq!(align_of::<CachePadded<u8>>(), 128);
    }

    #[test]
    fn deref_and_into_inner() {
        let padded = CachePadded::new(42usize);
        assert_eq!(*padded, 42);
        assert_eq!(padded.into_inner(), 42);
    }
}
