//! The process-wide runtime singleton tying every component together.
//!
//! Lazily initialized behind a `OnceLock`: the first call into any
//! public API function triggers construction, using whatever
//! [`Config`] was installed (or the default).
use std::sync::Arc;
use std::sync::OnceLock;

use turbo_sync::Pool;

use crate::config::Config;
use crate::entity::FiberEntity;
use crate::event::{self, EventPool};
use crate::io::IoReactor;
use crate::schedule_group::ScheduleGroup;
use crate::stack::StackPool;
use crate::timer::TimerThread;

pub(crate) struct Runtime {
    pub fibers: Pool<FiberEntity>,
    pub events: EventPool,
    pub stacks: StackPool,
    pub timers: Arc<TimerThread>,
    pub group: ScheduleGroup,
    pub io: IoReactor,
}

impl Runtime {
    fn start() -> Self {
        let config = Config::get();
        Self {
            fibers: Pool::new(),
            events: event::new_pool(),
            stacks: StackPool::new(),
            timers: TimerThread::start(),
            group: ScheduleGroup::start(config),
            io: IoReactor::start(config),
        }
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(Runtime::start)
}
