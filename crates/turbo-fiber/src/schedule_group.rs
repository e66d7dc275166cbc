//! The schedule group: the fixed array of worker seats, the parking
//! lots workers block on when idle, and the worker threads themselves.
//!
//! Parked workers are sharded across a handful of independent parking
//! lots so a single `signal_task` doesn't have to wake every idle
//! worker's condvar, only one shard's.
//!
//! This crate runs one process-wide schedule group (`Runtime::group`)
//! rather than several independent groups pinned to different NUMA
//! nodes.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use turbo_sync::ParkingLot;

use crate::config::Config;
use crate::error::Status;
use crate::id::FiberId;
use crate::worker::{self, Seat};

const PARKING_LOT_COUNT: usize = 4;

/// The shared state of a fiber worker pool: one [`Seat`] per worker
/// thread, and a small fixed bank of parking lots workers block on
/// when they find no work.
///
/// The seat array is sized to `max_concurrency` up front and never
/// reallocated; `active` tracks how many of those seats currently have
/// a running worker thread. This lets [`Self::grow_to`] hand out a
/// stable `&Seat` to a newly spawned worker without invalidating
/// references other threads already hold into earlier seats, at the
/// cost of only supporting growth, not shrinking a live group.
pub struct ScheduleGroup {
    seats: Box<[Seat]>,
    active: AtomicUsize,
    min_concurrency: usize,
    parking_lots: [ParkingLot; PARKING_LOT_COUNT],
    next_parking_lot: AtomicUsize,
    stopped: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ScheduleGroup {
    /// Builds a group with `max_concurrency` seats, starts
    /// `concurrency` of them, and spawns that many worker threads.
    /// Workers only start pulling from `Runtime` once running, so
    /// constructing this before `Runtime` itself is fully initialized
    /// is safe: a worker thread's first access to `runtime()` lazily
    /// completes that initialization if it hasn't already (see
    /// `runtime.rs`).
    pub fn start(config: &Config) -> Self {
        let floor = config.min_concurrency.max(1);
        let concurrency = config.concurrency.clamp(floor, config.max_concurrency.max(floor));
        let capacity = config.max_concurrency.max(concurrency);

        let seats: Vec<Seat> = (0..capacity)
            .map(|i| Seat::new(config.local_queue_capacity, config.remote_queue_capacity, i % PARKING_LOT_COUNT))
            .collect();

        let group = Self {
            seats: seats.into_boxed_slice(),
            active: AtomicUsize::new(concurrency),
            min_concurrency: floor,
            parking_lots: std::array::from_fn(|_| ParkingLot::new()),
            next_parking_lot: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            threads: Mutex::new(Vec::with_capacity(capacity)),
        };

        let handles = (0..concurrency).map(worker::spawn_worker_thread).collect();
        *group.threads.lock().unwrap_or_else(|e| e.into_inner()) = handles;

        group
    }

    pub fn concurrency(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_concurrency(&self) -> usize {
        self.seats.len()
    }

    /// Starts additional worker threads until `concurrency()` reaches
    /// `new_count`. Returns [`Status::EInval`] if `new_count` is not
    /// strictly greater than the current count, falls below the
    /// `min_concurrency` floor fixed at construction time, or exceeds
    /// the capacity fixed at construction time.
    pub fn grow_to(&self, new_count: usize) -> Result<(), Status> {
        let current = self.active.load(Ordering::Acquire);
        if new_count <= current || new_count < self.min_concurrency || new_count > self.seats.len() {
            return Err(Status::EInval);
        }
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for index in current..new_count {
            threads.push(worker::spawn_worker_thread(index));
        }
        self.active.store(new_count, Ordering::Release);
        Ok(())
    }

    pub(crate) fn seat(&self, index: usize) -> &Seat {
        &self.seats[index]
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Returns `true` if any active seat currently holds runnable
    /// work, checked by an idle worker right before it parks.
    pub(crate) fn has_work(&self, _excluding: usize) -> bool {
        let active = self.concurrency();
        self.seats[..active].iter().any(|seat| !seat.local.is_empty() || !seat.remote.is_empty())
    }

    pub(crate) fn parking_lot(&self, index: usize) -> &ParkingLot {
        &self.parking_lots[index % PARKING_LOT_COUNT]
    }

    /// Wakes enough parked workers to plausibly run `count` newly
    /// enqueued fibers, round-robining across the parking-lot shards
    /// so a burst of wakeups doesn't all land on the same lot.
    pub(crate) fn signal_task(&self, count: usize) {
        if count == 0 {
            return;
        }
        let lot = self.next_parking_lot.fetch_add(1, Ordering::Relaxed) % PARKING_LOT_COUNT;
        self.parking_lots[lot].signal(count);
    }

    /// Attempts to steal one fiber into `seat_index`'s worker, scanning
    /// active peers starting from a random offset.
    pub(crate) fn steal_into(&self, seat_index: usize) -> Option<FiberId> {
        let count = self.concurrency();
        if count <= 1 {
            return None;
        }
        let start = worker::random_seat_index();
        for offset in 0..count {
            let victim = (start + offset) % count;
            if victim == seat_index {
                continue;
            }
            let seat = &self.seats[victim];
            if let Some(fiber) = seat.local.pop() {
                return Some(fiber);
            }
            if let Some(fiber) = seat.remote.pop() {
                return Some(fiber);
            }
        }
        None
    }

    /// Stops all workers and joins their threads. Running fibers are
    /// allowed to finish their current switch; nothing new is dequeued
    /// once `stopped` is observed.
    pub fn stop_and_join(&self) {
        self.stopped.store(true, Ordering::Release);
        for lot in &self.parking_lots {
            lot.stop();
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }
    }
}
