use crate::{
    sync::{AtomicCounter, AtomicU32, Ordering},
    types::{SyncUnsafeCell, TaskId, Work},
};
use derive_more::Debug;

/// Units of pending work a freshly allocated task starts with: one for
/// "not yet finalized", one for "not yet executed".
pub(crate) const INITIAL_PENDING: u32 = 2;

/// One arena entry.
///
/// `pending` and `generation` may be read by any thread at any time, even
/// through a stale id. `layout` may only be touched by the thread that
/// currently owns the task (see [`TaskSlot::with_layout`]).
#[derive(Debug)]
#[repr(align(128))]
pub(crate) struct TaskSlot {
    /// Bumped every time the slot is freed.
    generation: AtomicU32,
    /// Outstanding units of work; the task completes when this reaches zero.
    pending: AtomicU32,
    layout: SyncUnsafeCell<TaskLayout>,
}

/// Owner-only part of a task slot.
#[derive(Debug, Default)]
pub(crate) struct TaskLayout {
    #[debug(skip)]
    pub(crate) work: Option<Work>,
    pub(crate) parent: Option<TaskId>,
    pub(crate) depends_on: Option<TaskId>,
    pub(crate) finalized: bool,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            layout: SyncUnsafeCell::new(TaskLayout::default()),
        }
    }

    /// Whether `id`'s task has completed.
    ///
    /// Completion is published by the generation bump in
    /// [`TaskSlot::invalidate`], so the answer never depends on whoever
    /// occupies the slot now and stale ids are always safe to test.
    pub(crate) fn is_complete(&self, id: TaskId) -> bool {
        self.generation.load(Ordering::Acquire) != id.generation()
    }

    /// Whether `id` currently owns this slot.
    pub(crate) fn is_live(&self, id: TaskId) -> bool {
        self.generation.load(Ordering::Acquire) == id.generation()
            && self.pending.load(Ordering::Acquire) != 0
    }

    /// Generation the next occupant of this slot will carry.
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Records one more outstanding unit (a child was attached).
    pub(crate) fn add_pending(&self) -> u32 {
        // The owning task is not finalized yet, so the counter cannot be
        // racing towards zero.
        self.pending.increment(Ordering::Relaxed)
    }

    /// Consumes one unit and returns how many remain.
    pub(crate) fn release_pending(&self) -> u32 {
        self.pending.decrement(Ordering::AcqRel)
    }

    /// Arms a free slot for a new task.
    ///
    /// # Safety
    ///
    /// The slot must be free and owned by the caller (its index was just
    /// popped from the free list).
    pub(crate) unsafe fn arm(&self, work: Work) {
        // SAFETY: a free slot is referenced by nobody else.
        unsafe {
            self.with_layout(|layout| {
                *layout = TaskLayout {
                    work: Some(work),
                    ..TaskLayout::default()
                };
            });
        }
        self.pending.store(INITIAL_PENDING, Ordering::Release);
    }

    /// Clears a slot whose counter just reached zero and returns the parent
    /// to notify.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the thread whose decrement brought the
    /// counter to zero, before [`TaskSlot::invalidate`].
    pub(crate) unsafe fn retire(&self) -> Option<TaskId> {
        // SAFETY: once the counter is zero no other thread owns the slot.
        unsafe { self.with_layout(|layout| core::mem::take(layout).parent) }
    }

    /// Marks the finished task complete by bumping the generation, which
    /// invalidates every outstanding id of it. The slot index may be
    /// recycled afterwards.
    pub(crate) fn invalidate(&self) {
        self.generation.increment(Ordering::Release);
    }

    /// Runs `f` with exclusive access to the owner-only part of the slot.
    ///
    /// # Safety
    ///
    /// The caller must own the task: it is the driver thread before
    /// `end_add`, the thread that dequeued the task, or the thread that
    /// brought the counter to zero. No other access may overlap.
    pub(crate) unsafe fn with_layout<R>(&self, f: impl FnOnce(&mut TaskLayout) -> R) -> R {
        // SAFETY: exclusivity is guaranteed by the caller.
        self.layout.with_mut(|ptr| f(unsafe { &mut *ptr }))
    }
}

/// Fixed array of task slots, indexed by [`TaskId::index`].
#[derive(Debug)]
pub(crate) struct TaskArena {
    slots: Box<[TaskSlot]>,
}

impl TaskArena {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| TaskSlot::new()).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot at `index`.
    pub(crate) fn get(&self, index: u32) -> &TaskSlot {
        &self.slots[index as usize]
    }

    /// Slot addressed by `id`, regardless of whether `id` is still current.
    pub(crate) fn slot(&self, id: TaskId) -> &TaskSlot {
        self.get(id.index())
    }

    pub(crate) fn is_complete(&self, id: TaskId) -> bool {
        self.slot(id).is_complete(id)
    }

    pub(crate) fn is_live(&self, id: TaskId) -> bool {
        self.slot(id).is_live(id)
    }
}
