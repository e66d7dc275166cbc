//! Cache-padded spinlocks, bounded ring queues and a parking lot used to
//! build the turbo fiber scheduler.
//!
//! None of this crate knows about fibers. It only provides the
//! low-level synchronization and allocation primitives that the
//! scheduler is built from, so that they can be tested and reasoned
//! about in isolation.

mod backoff;
mod cache_padded;
mod futex;
mod spin_lock;

pub mod array_queue;
pub mod parking_lot;
pub mod pool;

pub use backoff::Backoff;
pub use cache_padded::CachePadded;
pub use futex::{Futex, FutexGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};

pub use array_queue::ArrayQueue;
pub use parking_lot::{ParkingLot, ParkingState};
pub use pool::{Pool, PoolError, PoolId};
