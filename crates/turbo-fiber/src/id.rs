use std::fmt;

/// An opaque handle to a fiber: `(version, slot)` packed into a
/// single `u64`, matching a [`turbo_sync::PoolId`] one-to-one.
///
/// `slot` indexes into the fiber-entity pool; `version` distinguishes
/// successive occupants of the same slot. `FiberId::NONE` (`0`) never
/// names a live fiber. An id is valid only while the pool entry's
/// version still matches; any operation on a stale id returns
/// [`crate::Status::EInval`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// The reserved "no fiber" value.
    pub const NONE: FiberId = FiberId(0);

    pub(crate) fn from_pool_id(id: turbo_sync::PoolId) -> Self {
        // PoolId's generation starts at 0, but FiberId reserves 0 for
        // "no fiber". Shift every version up by one so a freshly
        // acquired slot's first occupant never collides with NONE.
        let raw = id.into_raw().wrapping_add(1u64 << 32);
        FiberId(raw)
    }

    pub(crate) fn to_pool_id(self) -> Option<turbo_sync::PoolId> {
        if self == FiberId::NONE {
            return None;
        }
        Some(turbo_sync::PoolId::from_raw(self.0.wrapping_sub(1u64 << 32)))
    }

    /// Returns `true` if this is the reserved "no fiber" id.
    pub fn is_none(self) -> bool {
        self == FiberId::NONE
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({:#018x})", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::FiberId;
    use turbo_sync::Pool;

    #[test]
    fn none_round_trips() {
        assert!(FiberId::NONE.is_none());
        assert!(FiberId::NONE.to_pool_id().is_none());
    }

    #[test]
    fn fresh_slot_never_produces_none() {
        let pool: Pool<u32> = Pool::new();
        let pool_id = pool.acquire(1);
        let fiber_id = FiberId::from_pool_id(pool_id);
        assert!(!fiber_id.is_none());
        assert_eq!(fiber_id.to_pool_id(), Some(pool_id));
    }
}
