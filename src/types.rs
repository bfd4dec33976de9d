use crate::sync::UnsafeCell;
use core::fmt;
use derive_more::{Deref, Display};

/// An `UnsafeCell` wrapper that is `Sync` whenever `T: Send`.
///
/// Used for task slots: access is serialized by the pending-count protocol
/// (a slot is only touched by the driver before finalization and by the one
/// thread that executes or completes it afterwards), which is the same
/// guarantee a mutex would give, hence the `Send` bound.
#[derive(Deref)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: see the type-level docs, at most one thread accesses the contents
// at any time.
unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

impl<T> fmt::Debug for SyncUnsafeCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncUnsafeCell").finish_non_exhaustive()
    }
}

/// Identifier of a task handed out by `Scheduler::begin_add`.
///
/// The index addresses a slot in the scheduler's arena; the generation
/// counts how often that slot has been recycled. A `TaskId` whose generation
/// no longer matches its slot refers to a task that has already completed,
/// so holding on to one after completion is always safe.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{index}v{generation}")]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot this task occupies (or occupied).
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Number of tasks that occupied the same slot before this one.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// A unit of work: a single opaque invokable that owns its captured state
/// and returns nothing. It must deal with its own errors.
pub type Work = Box<dyn FnOnce() + Send + 'static>;
