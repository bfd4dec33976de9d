//! Fork-join task graph scheduler for CPU-bound work.
//!
//! Callers describe a graph of work items linked by two kinds of edges:
//! - parent/child (fan-out): a parent completes only after all of its
//!   children have,
//! - dependency (single predecessor): a task is not started before the task
//!   it depends on has completed.
//!
//! A fixed pool of worker threads drains a lock-free ready queue, and a
//! thread blocked in `Scheduler::wait` executes ready work itself until the
//! task it waits on has completed.
//!
//! Completion is tracked with one atomic pending-count per task. Every
//! task starts with two units ("not yet finalized", "not yet executed") and
//! gains one per child; the thread whose decrement brings the counter to
//! zero retires the task and passes the decrement on to its parent. Task
//! slots live in a fixed arena and are recycled through a lock-free free
//! list; ids carry the slot generation so that a stale id is always
//! recognised as completed instead of aliasing the slot's next occupant.
//!
//! Quick start:
//! 1. Create a `Scheduler` with an arena large enough for the largest
//!    number of concurrently live tasks.
//! 2. `begin_add` each task, wire edges with `add_child` /
//!    `add_dependency`, and release it with `end_add`.
//! 3. `wait` on the root of the graph, then `stop` the scheduler.

/// Construction-time settings: arena capacity, pool size, thread naming and
/// idle backoff.
pub mod config;
/// Bounded lock-free multi-producer multi-consumer queue that holds ready
/// tasks.
pub mod queue;
/// Lock-free multi-producer single-consumer free list for task slot ids.
pub mod recycler;
/// The task graph scheduler.
///
/// Contains graph construction (`begin_add`, `add_child`,
/// `add_dependency`, `end_add`), the helper-driven `wait`, the completion
/// cascade, dependency promotion, and the worker pool.
pub mod scheduler;
mod sync;
mod task;
/// Task ids and the work item type.
pub mod types;
mod utils;
