//! Unbounded multi-producer single-consumer free list.
//!
//! An intrusive linked queue with a stub node: producers swap themselves in
//! as the new head and then link the previous head to their node, consumers
//! walk from the tail. Pushing is lock-free from any number of threads;
//! popping is only sound from one thread at a time.
//!
//! Between a producer's swap and its link store the queue is momentarily
//! disconnected, and `pop` reports it as empty even though an item is in
//! flight. Callers that know an item must exist retry.

use crate::sync::{AtomicPtr, Ordering, UnsafeCell};
use core::{fmt, ptr};
use crossbeam_utils::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Free list used to hand task slot ids back to the allocating thread.
pub struct Recycler<T> {
    /// Most recently pushed node; producers swap this.
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// Stub node owned by the consumer; its successor holds the next value.
    tail: UnsafeCell<*mut Node<T>>,
}

// SAFETY: values move from producers to the consumer, never shared.
unsafe impl<T: Send> Send for Recycler<T> {}
// SAFETY: `push` only touches `head` and the node it just published;
// `pop` is `unsafe` and requires a single consumer.
unsafe impl<T: Send> Sync for Recycler<T> {}

impl<T> Recycler<T> {
    /// Creates an empty free list.
    #[must_use]
    pub fn new() -> Self {
        let stub = Node::boxed(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: UnsafeCell::new(stub),
        }
    }

    /// Adds `value`. Lock-free and callable from any thread.
    pub fn push(&self, value: T) {
        let node = Node::boxed(Some(value));
        let prev = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` is freed only after the consumer has moved past it,
        // which requires observing the link stored here.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Takes the oldest value, if one is fully linked.
    ///
    /// # Safety
    ///
    /// No other call to `pop` may run concurrently.
    pub unsafe fn pop(&self) -> Option<T> {
        self.tail.with_mut(|tail| {
            // SAFETY: the caller guarantees exclusive access to `tail`; the
            // acquire load synchronizes with the producer that linked `next`,
            // and nodes behind the tail are only ever freed here.
            unsafe {
                let stub = *tail;
                let next = (*stub).next.load(Ordering::Acquire);
                if next.is_null() {
                    return None;
                }
                *tail = next;
                drop(Box::from_raw(stub));
                (*next).value.take()
            }
        })
    }
}

impl<T> Default for Recycler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Recycler<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent producers and consumers.
        unsafe {
            while self.pop().is_some() {}
            self.tail.with_mut(|tail| drop(Box::from_raw(*tail)));
        }
    }
}

impl<T> fmt::Debug for Recycler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recycler").finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn pops_in_push_order() {
        let recycler = Recycler::new();
        // SAFETY: single-threaded test.
        unsafe {
            assert_eq!(recycler.pop(), None);
            for id in 0..4_u32 {
                recycler.push(id);
            }
            for id in 0..4 {
                assert_eq!(recycler.pop(), Some(id));
            }
            assert_eq!(recycler.pop(), None);
        }
    }

    #[test]
    fn frees_values_left_behind() {
        let item = Arc::new(());
        let recycler = Recycler::new();
        recycler.push(item.clone());
        recycler.push(item.clone());
        drop(recycler);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn concurrent_pushes_reach_the_single_consumer() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 5_000;
        const TOTAL: u32 = PRODUCERS * PER_PRODUCER;

        let recycler = Arc::new(Recycler::new());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let recycler = recycler.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        recycler.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        // This thread is the only consumer.
        let mut seen = vec![false; TOTAL as usize];
        let mut received = 0;
        while received < TOTAL {
            // SAFETY: only this thread pops.
            match unsafe { recycler.pop() } {
                Some(id) => {
                    assert!(!seen[id as usize], "id {id} popped twice");
                    seen[id as usize] = true;
                    received += 1;
                }
                None => thread::yield_now(),
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        // SAFETY: all producers joined, single consumer.
        assert_eq!(unsafe { recycler.pop() }, None);
    }
}
