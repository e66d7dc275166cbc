/// The stack kind a fiber runs on.
///
/// `Pthread` fibers share the worker's own OS stack: no allocation,
/// no context switch, used both as an explicit choice and as the
/// fallback when the stack pool for a size class is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StackKind {
    Small,
    #[default]
    Normal,
    Large,
    /// The worker's scheduling-loop stack; never handed to user fibers.
    Main,
    /// No dedicated stack; runs inline on the worker's OS stack.
    Pthread,
}

bitflags::bitflags! {
    /// Per-fiber behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u8 {
        /// Suppress the worker wakeup normally issued on enqueue, so a
        /// caller enqueuing a batch of fibers can signal once at the end
        /// instead of waking a worker per fiber.
        const NO_SIGNAL = 1 << 0;
        /// Emit a `tracing` span covering the fiber's lifetime.
        const LOG_START_FINISH = 1 << 1;
        /// Emit a `tracing` event on every context switch into/out of
        /// this fiber.
        const LOG_SWITCH = 1 << 2;
        /// The fiber ignores `stop`/`interrupt` (used for bookkeeping
        /// fibers the runtime itself starts, e.g. the I/O reactor loop).
        const NEVER_QUIT = 1 << 3;
    }
}

/// Attributes a fiber is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub stack_kind: StackKind,
    pub flags: AttrFlags,
}

impl Attr {
    /// The default attribute set: a `normal` stack, no flags.
    pub const fn new() -> Self {
        Self { stack_kind: StackKind::Normal, flags: AttrFlags::empty() }
    }

    pub fn with_stack_kind(mut self, kind: StackKind) -> Self {
        self.stack_kind = kind;
        self
    }

    pub fn with_flags(mut self, flags: AttrFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn nosignal(&self) -> bool {
        self.flags.contains(AttrFlags::NO_SIGNAL)
    }

    pub fn log_start_finish(&self) -> bool {
        self.flags.contains(AttrFlags::LOG_START_FINISH)
    }

    pub fn log_switch(&self) -> bool {
        self.flags.contains(AttrFlags::LOG_SWITCH)
    }

    pub fn never_quit(&self) -> bool {
        self.flags.contains(AttrFlags::NEVER_QUIT)
    }
}

impl Default for Attr {
    fn default() -> Self {
        Self::new()
    }
}
