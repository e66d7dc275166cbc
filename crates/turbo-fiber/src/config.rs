//! Process-wide runtime configuration, settable once before first use.
//!
//! A plain builder struct whose `build()` is consumed exactly once, at
//! the first call into the runtime, and cached in a `OnceLock`.
use std::sync::OnceLock;

/// Process-wide runtime configuration.
///
/// Settable once via [`Config::install`] before the first fiber is
/// started; afterwards [`Config::get`] always returns the same value
/// (the default, if nothing was installed).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of workers started by `ScheduleGroup::init`.
    pub concurrency: usize,
    /// Floor for `set_concurrency`.
    pub min_concurrency: usize,
    /// Ceiling for `set_concurrency` and for automatic worker growth.
    pub max_concurrency: usize,
    /// Capacity of each worker's local run-queue.
    pub local_queue_capacity: usize,
    /// Capacity of each worker's remote run-queue.
    pub remote_queue_capacity: usize,
    /// Stack size, in bytes, for the `small` stack kind.
    pub small_stack_bytes: usize,
    /// Stack size, in bytes, for the `normal` stack kind.
    pub normal_stack_bytes: usize,
    /// Stack size, in bytes, for the `large` stack kind.
    pub large_stack_bytes: usize,
    /// Maximum number of idle stacks kept per size class.
    pub stack_freelist_cap: usize,
    /// Number of OS threads tending epoll/kqueue reactors.
    pub io_thread_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            concurrency: parallelism,
            min_concurrency: 1,
            max_concurrency: parallelism.max(1) * 4,
            local_queue_capacity: 4096,
            remote_queue_capacity: 2048,
            small_stack_bytes: 32 * 1024,
            normal_stack_bytes: 256 * 1024,
            large_stack_bytes: 1024 * 1024,
            stack_freelist_cap: 256,
            io_thread_count: 1,
        }
    }
}

/// Builds a [`Config`] before installing it with [`Config::install`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Starts from [`Config::default`].
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    /// Sets the initial worker count.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    /// Sets the minimum and maximum concurrency bounds.
    pub fn concurrency_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.min_concurrency = min;
        self.config.max_concurrency = max;
        self
    }

    /// Sets the local/remote run-queue capacities.
    pub fn queue_capacities(mut self, local: usize, remote: usize) -> Self {
        self.config.local_queue_capacity = local;
        self.config.remote_queue_capacity = remote;
        self
    }

    /// Sets the per-kind stack sizes, in bytes.
    pub fn stack_sizes(mut self, small: usize, normal: usize, large: usize) -> Self {
        self.config.small_stack_bytes = small;
        self.config.normal_stack_bytes = normal;
        self.config.large_stack_bytes = large;
        self
    }

    /// Sets the maximum number of idle stacks kept per size class.
    pub fn stack_freelist_cap(mut self, cap: usize) -> Self {
        self.config.stack_freelist_cap = cap;
        self
    }

    /// Sets the number of I/O reactor threads.
    pub fn io_thread_count(mut self, n: usize) -> Self {
        self.config.io_thread_count = n;
        self
    }

    /// Finishes the builder, producing a [`Config`].
    pub fn build(self) -> Config {
        self.config
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Installs `self` as the process-wide configuration.
    ///
    /// Returns `Err(self)` if a configuration was already installed
    /// (by an earlier `install` call, or implicitly by the runtime
    /// starting with defaults).
    pub fn install(self) -> Result<(), Config> {
        CONFIG.set(self)
    }

    /// Returns the process-wide configuration, installing the default
    /// one if nothing has been installed yet.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder};

    #[test]
    fn builder_overrides_defaults() {
        let config = ConfigBuilder::new().concurrency(3).queue_capacities(128, 64).build();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.local_queue_capacity, 128);
        assert_eq!(config.remote_queue_capacity, 64);
    }

    #[test]
    fn default_concurrency_is_at_least_one() {
        assert!(Config::default().concurrency >= 1);
    }
}
