//! The `Status` taxonomy shared by every blocking and non-blocking
//! entry point in this crate.
//!
//! Wait outcomes (`ETIMEDOUT`, `EWOULDBLOCK`, `EINTR`, `ESTOP`) are
//! normal returns, not failures: callers are expected to match on
//! them rather than treat every non-`Ok` as exceptional.

/// The result type returned by fallible scheduler operations.
pub type FiberResult<T> = Result<T, Status>;

/// Error and wait-outcome codes shared across the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    /// An argument was invalid: a stale or unknown tid, a null
    /// function pointer, an out-of-range concurrency value.
    #[error("invalid argument")]
    EInval,
    /// A resource pool (fiber slots, stacks) is exhausted.
    #[error("out of memory")]
    ENoMem,
    /// A wait or sleep reached its deadline without being satisfied.
    #[error("timed out")]
    ETimedOut,
    /// A blocking call was interrupted by `interrupt`/`stop`.
    #[error("interrupted")]
    EIntr,
    /// A wait's expected value did not match; would have to block.
    #[error("would block")]
    EWouldBlock,
    /// The file descriptor is closed or otherwise invalid.
    #[error("bad file descriptor")]
    EBadF,
    /// The fiber, worker, or schedule group is stopping or stopped.
    #[error("stopping")]
    EStop,
    /// A bounded queue or pool could not accept more work right now.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// The named id, event, or fd is not known to the runtime.
    #[error("not found")]
    NotFound,
    /// The target is mid-operation (e.g. a timer callback is running).
    #[error("busy")]
    Busy,
}

impl Status {
    /// `true` for the wait-outcome family (`ETIMEDOUT`/`EWouldBlock`/
    /// `EIntr`/`EStop`), which are normal returns rather than errors.
    pub fn is_wait_outcome(self) -> bool {
        matches!(self, Status::ETimedOut | Status::EWouldBlock | Status::EIntr | Status::EStop)
    }
}

/// Alias kept for readers coming from the C taxonomy; `Status` and
/// `FiberError` name the same type.
pub type FiberError = Status;
