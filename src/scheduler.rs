mod execute;
mod setup;

/// Errors returned by fallible scheduler operations.
pub use crate::scheduler::setup::{SchedulerError, SchedulerSetupError};
use crate::{
    config::{BackoffConfig, Config},
    queue::BoundedQueue,
    recycler::Recycler,
    sync::{Arc, AtomicBool, AtomicCounter, AtomicUsize, Mutex, Ordering, thread::JoinHandle},
    task::TaskArena,
    types::{TaskId, Work},
    utils::Backoff,
};
use core::{any::Any, cell::Cell, fmt, marker::PhantomData};

/// Fork-join task graph scheduler.
///
/// Tasks are described in three steps: [`begin_add`] allocates a slot for a
/// work item, [`add_child`] / [`add_dependency`] wire edges, and [`end_add`]
/// releases the task for execution. [`wait`] returns once a task, all of its
/// children (transitively) and everything they were waiting on have run.
///
/// A scheduler is driven from one thread at a time: it is `Send` but not
/// `Sync`. The pool threads only ever execute and complete tasks.
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use tgs::scheduler::Scheduler;
///
/// let scheduler = Scheduler::with_threads(64, 2).unwrap();
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let root = scheduler.begin_add(|| {});
/// for _ in 0..8 {
///     let counter = counter.clone();
///     let child = scheduler.begin_add(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     });
///     scheduler.add_child(root, child);
///     scheduler.end_add(child);
/// }
/// scheduler.end_add(root);
///
/// scheduler.wait(root);
/// assert_eq!(counter.load(Ordering::Relaxed), 8);
/// scheduler.stop().unwrap();
/// ```
///
/// [`begin_add`]: Scheduler::begin_add
/// [`add_child`]: Scheduler::add_child
/// [`add_dependency`]: Scheduler::add_dependency
/// [`end_add`]: Scheduler::end_add
/// [`wait`]: Scheduler::wait
#[must_use]
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// `begin_add` pops the single-consumer free list.
    _not_sync: PhantomData<Cell<()>>,
}

/// State shared between the driving thread and the pool.
#[derive(Debug)]
pub(crate) struct Shared {
    arena: TaskArena,
    /// Finalized tasks with no unresolved dependency.
    ready: BoundedQueue<TaskId>,
    /// Finalized tasks whose predecessor has not completed yet.
    held: Mutex<Vec<HeldTask>>,
    /// Payloads of work items that panicked, not yet re-raised.
    panics: Mutex<Vec<Box<dyn Any + Send>>>,
    /// Indices of free arena slots.
    free: Recycler<u32>,
    /// Allocated and not yet completed tasks.
    live: AtomicUsize,
    stop: AtomicBool,
    backoff: BackoffConfig,
}

#[derive(Debug, Clone, Copy)]
struct HeldTask {
    id: TaskId,
    depends_on: TaskId,
}

impl Scheduler {
    /// Scheduler with `capacity` task slots and the default worker count
    /// (hardware parallelism minus one).
    ///
    /// # Errors
    ///
    /// See [`Scheduler::with_config`].
    pub fn new(capacity: usize) -> Result<Self, SchedulerSetupError> {
        Self::with_config(Config::new(capacity))
    }

    /// Scheduler with `capacity` task slots and `worker_threads` pool
    /// threads.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::with_config`].
    pub fn with_threads(
        capacity: usize,
        worker_threads: usize,
    ) -> Result<Self, SchedulerSetupError> {
        Self::with_config(Config::new(capacity).worker_threads(worker_threads))
    }

    /// Allocates a task slot for `work` and returns its id.
    ///
    /// The task stays dormant until [`Scheduler::end_add`] is called on it.
    ///
    /// # Panics
    ///
    /// If every slot of the arena is taken. Size the capacity for the worst
    /// case, or use [`Scheduler::try_begin_add`].
    pub fn begin_add<F>(&self, work: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_begin_add(work)
            .unwrap_or_else(|err| panic!("Scheduler::begin_add: {err}"))
    }

    /// Fallible form of [`Scheduler::begin_add`].
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ArenaExhausted`] if every slot is taken.
    pub fn try_begin_add<F>(&self, work: F) -> Result<TaskId, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &*self.shared;
        let capacity = shared.arena.capacity();
        if shared.live.increment(Ordering::AcqRel) > capacity {
            shared.live.decrement(Ordering::AcqRel);
            tracing::warn!(capacity, "task arena exhausted");
            return Err(SchedulerError::ArenaExhausted { capacity });
        }
        // `live` is decremented before a freed index is pushed, so a slot is
        // either on the list or about to be.
        let mut backoff = Backoff::new(shared.backoff);
        let index = loop {
            // SAFETY: `Scheduler` is `!Sync`, this is the only consumer.
            if let Some(index) = unsafe { shared.free.pop() } {
                break index;
            }
            backoff.snooze();
        };
        let slot = shared.arena.get(index);
        let work: Work = Box::new(work);
        // SAFETY: the index came off the free list, nobody else owns it.
        unsafe { slot.arm(work) };
        let id = TaskId::new(index, slot.generation());
        tracing::trace!(%id, "task allocated");
        Ok(id)
    }

    /// Makes `child` a child of `parent`: `parent` completes only after
    /// `child` has.
    ///
    /// Both tasks must be live and not yet finalized, and `child` must have
    /// neither a parent nor a dependency.
    pub fn add_child(&self, parent: TaskId, child: TaskId) {
        let arena = &self.shared.arena;
        assert_ne!(parent, child, "Task {child} cannot be its own child");
        assert!(arena.is_live(parent), "Task {parent} is not live");
        assert!(arena.is_live(child), "Task {child} is not live");
        // SAFETY: unfinalized tasks are owned by the driving thread.
        unsafe {
            arena.slot(parent).with_layout(|layout| {
                assert!(!layout.finalized, "Task {parent} gained a child after end_add");
            });
            arena.slot(child).with_layout(|layout| {
                assert!(!layout.finalized, "Task {child} became a child after end_add");
                assert!(
                    layout.parent.is_none(),
                    "Task {child} already has parent {:?}",
                    layout.parent
                );
                assert!(
                    layout.depends_on.is_none(),
                    "Task {child} has a dependency and cannot become a child"
                );
                layout.parent = Some(parent);
            });
        }
        let pending = arena.slot(parent).add_pending();
        tracing::trace!(%parent, %child, pending, "child attached");
    }

    /// Holds `dependent` back until `predecessor` has completed.
    ///
    /// `dependent` must be live and not yet finalized, and may depend on at
    /// most one task. `predecessor` may already have completed, in which case
    /// the edge is satisfied immediately.
    pub fn add_dependency(&self, predecessor: TaskId, dependent: TaskId) {
        let arena = &self.shared.arena;
        assert_ne!(
            predecessor, dependent,
            "Task {dependent} cannot depend on itself"
        );
        assert!(arena.is_live(dependent), "Task {dependent} is not live");
        // SAFETY: an unfinalized task is owned by the driving thread.
        unsafe {
            arena.slot(dependent).with_layout(|layout| {
                assert!(
                    !layout.finalized,
                    "Task {dependent} gained a dependency after end_add"
                );
                assert!(
                    layout.depends_on.is_none(),
                    "Task {dependent} already depends on {:?}",
                    layout.depends_on
                );
                layout.depends_on = Some(predecessor);
            });
        }
        tracing::trace!(%predecessor, %dependent, "dependency attached");
    }

    /// Finalizes `id`: it becomes eligible to run as soon as its dependency
    /// (if any) has completed.
    ///
    /// Must be called exactly once per task.
    pub fn end_add(&self, id: TaskId) {
        let shared = &*self.shared;
        assert!(shared.arena.is_live(id), "Task {id} is not live");
        // SAFETY: the task is not finalized yet, the driving thread owns it.
        let depends_on = unsafe {
            shared.arena.slot(id).with_layout(|layout| {
                assert!(!layout.finalized, "Task {id} finalized twice");
                layout.finalized = true;
                layout.depends_on
            })
        };
        match depends_on {
            Some(predecessor) if !shared.arena.is_complete(predecessor) => {
                shared.held.lock().push(HeldTask {
                    id,
                    depends_on: predecessor,
                });
                tracing::trace!(%id, %predecessor, "task held");
            }
            _ => {
                shared.push_ready(id);
                tracing::trace!(%id, "task ready");
            }
        }
        // The "not yet executed" unit keeps the slot alive across this call.
        shared.complete(id);
    }

    /// Allocates and finalizes a task without edges.
    pub fn submit<F>(&self, work: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.begin_add(work);
        self.end_add(id);
        id
    }

    /// Returns once `id` and everything it transitively waits on has
    /// completed.
    ///
    /// The calling thread never idles while ready work exists: it executes
    /// queued tasks itself and promotes held tasks whose dependency has
    /// resolved, so progress is guaranteed even without pool threads.
    ///
    /// # Panics
    ///
    /// A work item that panics still completes, so the graph keeps
    /// draining. Its panic is re-raised here, on whichever thread waits
    /// next, with the original payload.
    pub fn wait(&self, id: TaskId) {
        let shared = &*self.shared;
        let _span = tracing::trace_span!("wait", %id).entered();
        shared.help_until(|| shared.arena.is_complete(id));
    }

    /// Returns once every task allocated so far has completed.
    ///
    /// Re-raises work item panics like [`Scheduler::wait`].
    ///
    /// The live count drops slightly before the finishing thread publishes
    /// completion, so [`Scheduler::is_complete`] may briefly lag behind this.
    pub fn wait_all(&self) {
        let shared = &*self.shared;
        let _span = tracing::trace_span!("wait_all").entered();
        shared.help_until(|| shared.live.load(Ordering::Acquire) == 0);
    }

    /// Whether `id` has completed. Always true for ids whose slot has since
    /// been reused.
    #[must_use]
    pub fn is_complete(&self, id: TaskId) -> bool {
        self.shared.arena.is_complete(id)
    }

    /// Number of allocated tasks that have not completed yet.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Maximum number of concurrently live tasks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.arena.capacity()
    }

    /// Number of pool threads spawned for this scheduler and not yet joined
    /// by [`Scheduler::stop`]. A worker that died from a panic outside any
    /// work item is still counted.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.workers.len()
    }

    /// Signals the pool threads to exit and joins them.
    ///
    /// Draining is best effort: a task a worker has already dequeued runs to
    /// completion, tasks still queued are dropped without running. Wait on
    /// all outstanding roots (or call [`Scheduler::wait_all`]) first if every
    /// task must run.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::WorkerPanicked`] if a pool thread died.
    /// - [`SchedulerError::TaskPanicked`] if work items panicked and no
    ///   [`Scheduler::wait`] re-raised them.
    pub fn stop(mut self) -> Result<(), SchedulerError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SchedulerError> {
        let mut dead = 0;
        if !self.workers.is_empty() {
            self.shared.stop.store(true, Ordering::Release);
            dead = self
                .workers
                .drain(..)
                .map(JoinHandle::join)
                .filter(Result::is_err)
                .count();
            tracing::info!(
                live = self.shared.live.load(Ordering::Acquire),
                "scheduler stopped"
            );
        }
        let panicked = core::mem::take(&mut *self.shared.panics.lock()).len();
        if dead != 0 {
            Err(SchedulerError::WorkerPanicked { count: dead })
        } else if panicked != 0 {
            Err(SchedulerError::TaskPanicked { count: panicked })
        } else {
            Ok(())
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(%err, "scheduler dropped with unreported failures");
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("capacity", &self.capacity())
            .field("worker_threads", &self.worker_threads())
            .field("live_tasks", &self.live_tasks())
            .finish_non_exhaustive()
    }
}
