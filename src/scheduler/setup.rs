use crate::{
    config::{Config, MAX_SPIN_LIMIT},
    queue::BoundedQueue,
    recycler::Recycler,
    scheduler::{Scheduler, Shared},
    sync::{Arc, AtomicBool, AtomicUsize, Mutex, thread},
    task::TaskArena,
    utils::default_worker_threads,
};
use core::marker::PhantomData;
use std::io;
use thiserror::Error;

/// Error kind for scheduler construction failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerSetupError {
    /// The arena capacity is not a power of two, or smaller than 2.
    #[error("capacity must be a power of two >= 2, got {0}")]
    InvalidCapacity(usize),
    /// The arena capacity does not fit the 32-bit slot index of a task id.
    #[error("capacity {0} exceeds the addressable number of task slots")]
    CapacityTooLarge(usize),
    /// The backoff ladder never escalates past spinning, or spins too long
    /// per step.
    #[error(
        "invalid backoff: spin_limit {spin_limit} exceeds yield_limit {yield_limit} or {max}",
        max = MAX_SPIN_LIMIT
    )]
    InvalidBackoff {
        /// Configured last spinning step.
        spin_limit: u32,
        /// Configured last yielding step.
        yield_limit: u32,
    },
    /// The operating system refused to start a pool thread.
    #[error("failed to spawn worker thread {worker}")]
    Spawn {
        /// Index of the worker that could not be started.
        worker: usize,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },
}

/// Error kind for failures while the scheduler is running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Every arena slot is held by a live task.
    #[error("task arena exhausted, all {capacity} slots are live")]
    ArenaExhausted {
        /// Arena size.
        capacity: usize,
    },
    /// Pool threads terminated by a panic outside of any work item.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked {
        /// Number of workers that panicked.
        count: usize,
    },
    /// Work items panicked and no `wait` re-raised the panic.
    #[error("{count} task(s) panicked")]
    TaskPanicked {
        /// Number of unreported task panics.
        count: usize,
    },
}

impl Scheduler {
    /// Builds the arena, ready queue and free list, then starts the pool.
    ///
    /// # Errors
    ///
    /// - [`SchedulerSetupError::InvalidCapacity`] if `config.capacity` is not
    ///   a power of two >= 2.
    /// - [`SchedulerSetupError::CapacityTooLarge`] if it exceeds the 32-bit
    ///   slot index space.
    /// - [`SchedulerSetupError::InvalidBackoff`] if `config.backoff` has a
    ///   `spin_limit` above its `yield_limit` or above
    ///   [`MAX_SPIN_LIMIT`].
    /// - [`SchedulerSetupError::Spawn`] if a worker thread cannot be started;
    ///   workers started before the failure are shut down again.
    pub fn with_config(config: Config) -> Result<Self, SchedulerSetupError> {
        let Config {
            capacity,
            worker_threads,
            thread_name,
            backoff,
        } = config;
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(SchedulerSetupError::InvalidCapacity(capacity));
        }
        let Ok(last_index) = u32::try_from(capacity - 1) else {
            return Err(SchedulerSetupError::CapacityTooLarge(capacity));
        };
        if backoff.spin_limit > backoff.yield_limit || backoff.spin_limit > MAX_SPIN_LIMIT {
            return Err(SchedulerSetupError::InvalidBackoff {
                spin_limit: backoff.spin_limit,
                yield_limit: backoff.yield_limit,
            });
        }

        let free = Recycler::new();
        for index in 0..=last_index {
            free.push(index);
        }
        let shared = Arc::new(Shared {
            arena: TaskArena::new(capacity),
            // Every queued task occupies an arena slot, so the queue can
            // never overflow.
            ready: BoundedQueue::new(capacity),
            held: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
            free,
            live: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            backoff,
        });

        let worker_threads = worker_threads.unwrap_or_else(default_worker_threads);
        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(worker_threads),
            _not_sync: PhantomData,
        };
        for worker in 0..worker_threads {
            let shared = scheduler.shared.clone();
            let handle = thread::spawn_named(format!("{thread_name}-{worker}"), move || {
                shared.run_worker(worker);
            })
            .map_err(|source| SchedulerSetupError::Spawn { worker, source })?;
            scheduler.workers.push(handle);
        }
        tracing::info!(capacity, worker_threads, "scheduler started");
        Ok(scheduler)
    }
}
