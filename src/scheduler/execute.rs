use crate::{
    scheduler::Shared,
    sync::{AtomicCounter, Ordering},
    types::TaskId,
    utils::Backoff,
};
use std::panic::{self, AssertUnwindSafe};

impl Shared {
    pub(super) fn push_ready(&self, id: TaskId) {
        if self.ready.push(id).is_err() {
            unreachable!("Shared::push_ready: ready queue holds more tasks than the arena");
        }
    }

    /// Consumes one pending unit of `id` and runs the completion cascade.
    ///
    /// Finalization, execution and the completion of a child are all the
    /// same decrement. The thread that brings a counter to zero retires the
    /// slot, frees its index and moves on to the parent; nothing may touch
    /// the slot through `id` after that.
    pub(super) fn complete(&self, id: TaskId) {
        let mut current = Some(id);
        while let Some(id) = current.take() {
            let slot = self.arena.slot(id);
            let remaining = slot.release_pending();
            if remaining != 0 {
                break;
            }
            // SAFETY: this thread's decrement reached zero, it owns the slot.
            current = unsafe { slot.retire() };
            // `live` drops before the task reads as complete, so a waiter that
            // returns can allocate again; while `live` is below capacity
            // `begin_add` can count on an index being (or becoming) free.
            self.live.decrement(Ordering::AcqRel);
            slot.invalidate();
            self.free.push(id.index());
            tracing::trace!(%id, "task completed");
        }
    }

    /// Dequeues and executes one ready task. Returns `false` if the queue
    /// was empty.
    ///
    /// A panicking work item still completes; its payload is parked until a
    /// waiter re-raises it.
    pub(super) fn run_one(&self) -> bool {
        let Some(id) = self.ready.pop() else {
            return false;
        };
        // SAFETY: a dequeued task is owned by the dequeuing thread until it
        // gives up the "not yet executed" unit below.
        let work = unsafe { self.arena.slot(id).with_layout(|layout| layout.work.take()) };
        tracing::trace!(%id, "running task");
        let outcome = work.map_or(Ok(()), |work| panic::catch_unwind(AssertUnwindSafe(work)));
        if let Err(payload) = outcome {
            tracing::error!(%id, "work item panicked");
            self.panics.lock().push(payload);
        }
        self.complete(id);
        true
    }

    /// Re-raises a parked work item panic on the calling thread.
    fn resume_panic(&self) {
        let payload = self.panics.lock().pop();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    /// Moves held tasks whose predecessor has completed to the ready queue.
    ///
    /// Never blocks: if another thread is using the held set this round is
    /// skipped and `0` is returned.
    pub(super) fn promote_held(&self) -> usize {
        let Some(mut held) = self.held.try_lock() else {
            return 0;
        };
        let mut promoted = 0;
        let mut i = 0;
        while i < held.len() {
            // Predecessor ids may be stale; a generation mismatch counts
            // as completed and never dereferences the new occupant.
            if self.arena.is_complete(held[i].depends_on) {
                let task = held.swap_remove(i);
                self.push_ready(task.id);
                promoted += 1;
            } else {
                i += 1;
            }
        }
        drop(held);
        if promoted != 0 {
            tracing::debug!(promoted, "promoted held tasks");
        }
        promoted
    }

    /// Helper loop shared by `wait` and `wait_all`: execute and promote
    /// until `done` holds, backing off only while there is nothing to do.
    pub(super) fn help_until(&self, mut done: impl FnMut() -> bool) {
        let mut backoff = Backoff::new(self.backoff);
        while !done() {
            self.resume_panic();
            let promoted = self.promote_held();
            if self.run_one() || promoted != 0 {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        // A panic parked before `done` turned true is visible here.
        self.resume_panic();
    }

    /// Pool thread main loop. The stop flag is checked between dequeue
    /// attempts only, so a task that was dequeued always runs.
    pub(super) fn run_worker(&self, worker: usize) {
        let _span = tracing::debug_span!("worker", worker).entered();
        tracing::debug!("worker started");
        let mut backoff = Backoff::new(self.backoff);
        while !self.stop.load(Ordering::Acquire) {
            if self.run_one() {
                backoff.reset();
                continue;
            }
            if self.promote_held() != 0 {
                backoff.reset();
                continue;
            }
            let was_sleeping = backoff.is_sleeping();
            backoff.snooze();
            if !was_sleeping && backoff.is_sleeping() {
                tracing::trace!("worker idle");
            }
        }
        tracing::debug!("stop signal received, shutting down");
    }
}
