//! Bounded lock-free multi-producer multi-consumer queue.
//!
//! A ring of cells, each carrying a sequence number next to its item. The
//! sequence tells every thread which lap the cell belongs to:
//!
//! - `seq == pos`: empty and ready for the producer that claims `pos`,
//! - `seq == pos + 1`: filled and ready for the consumer that claims `pos`,
//! - `seq == pos + capacity`: drained and ready for the next lap.
//!
//! Producers and consumers claim positions with a compare-exchange on their
//! cursor and publish with a release store of the cell's sequence. Nothing
//! ever blocks: a full or empty queue is reported to the caller.

use crate::sync::{AtomicUsize, Ordering, UnsafeCell};
use core::{cmp, fmt, mem::MaybeUninit};
use crossbeam_utils::CachePadded;

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity MPMC ring buffer.
///
/// ```
/// use tgs::queue::BoundedQueue;
///
/// let queue = BoundedQueue::new(2);
/// assert!(queue.push(1).is_ok());
/// assert!(queue.push(2).is_ok());
/// assert_eq!(queue.push(3), Err(3));
/// assert_eq!(queue.pop(), Some(1));
/// ```
pub struct BoundedQueue<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: items are moved in by one thread and out by another, never shared.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
// SAFETY: each cell is owned by exactly one claimant between the cursor CAS
// and the sequence store that publishes it.
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// If `capacity` is not a power of two or is smaller than 2.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "BoundedQueue capacity must be a power of two >= 2, got {capacity}"
        );
        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Appends `value`, or hands it back if every cell is occupied.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            match lap_distance(seq, pos).cmp(&0) {
                cmp::Ordering::Equal => {
                    match self.enqueue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: the CAS made this thread the only writer of the
                            // cell until the sequence store below hands it over.
                            cell.value
                                .with_mut(|ptr| unsafe { ptr.write(MaybeUninit::new(value)) });
                            cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                            return Ok(());
                        }
                        Err(current) => pos = current,
                    }
                }
                // The cell still holds an item from the previous lap.
                cmp::Ordering::Less => return Err(value),
                cmp::Ordering::Greater => pos = self.enqueue_pos.load(Ordering::Relaxed),
            }
        }
    }

    /// Removes the oldest item, or returns `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            match lap_distance(seq, pos.wrapping_add(1)).cmp(&0) {
                cmp::Ordering::Equal => {
                    match self.dequeue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: the acquire load of `seq` observed the producer's
                            // publication and the CAS made this thread its only reader.
                            let value = cell.value.with(|ptr| unsafe { ptr.read().assume_init() });
                            cell.sequence
                                .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                            return Some(value);
                        }
                        Err(current) => pos = current,
                    }
                }
                cmp::Ordering::Less => return None,
                cmp::Ordering::Greater => pos = self.dequeue_pos.load(Ordering::Relaxed),
            }
        }
    }

    /// Maximum number of items the queue holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of items currently enqueued. Exact only while no other thread
    /// is pushing or popping.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        let head = self.dequeue_pos.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// Whether the queue currently holds no items (same caveat as [`len`]).
    ///
    /// [`len`]: BoundedQueue::len
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Signed distance between a cell sequence and a cursor, tolerant of
/// wrap-around.
#[allow(clippy::cast_possible_wrap)]
#[inline]
fn lap_distance(seq: usize, pos: usize) -> isize {
    seq.wrapping_sub(pos) as isize
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    #[test]
    fn reports_full_exactly_at_capacity() {
        let queue = BoundedQueue::new(8);
        for i in 0..8 {
            assert_eq!(queue.len(), i);
            queue.push(i).expect("queue has room");
        }
        assert_eq!(queue.push(8), Err(8));
        assert_eq!(queue.pop(), Some(0));
        queue.push(8).expect("a slot was freed");
        assert_eq!(queue.push(9), Err(9));
    }

    #[test]
    fn reports_empty_and_keeps_fifo_order_across_laps() {
        let queue = BoundedQueue::new(4);
        assert_eq!(queue.pop(), None);
        for lap in 0..5 {
            for i in 0..3 {
                queue.push(lap * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(queue.pop(), Some(lap * 10 + i));
            }
            assert!(queue.is_empty());
            assert_eq!(queue.pop(), None);
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        let _ = BoundedQueue::<u32>::new(6);
    }

    #[test]
    fn drops_items_left_behind() {
        let item = Arc::new(());
        let queue = BoundedQueue::new(4);
        queue.push(item.clone()).unwrap();
        queue.push(item.clone()).unwrap();
        assert_eq!(Arc::strong_count(&item), 3);
        drop(queue);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_and_duplicate_nothing() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 20_000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let queue = Arc::new(BoundedQueue::new(64));
        let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        while let Err(back) = queue.push(item) {
                            item = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut seen = Vec::new();
                    while consumed.load(Ordering::Relaxed) < TOTAL {
                        match queue.pop() {
                            Some(item) => {
                                consumed.fetch_add(1, Ordering::Relaxed);
                                seen.push(item);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut counts = vec![0_u8; TOTAL];
        for consumer in consumers {
            for item in consumer.join().unwrap() {
                counts[item] += 1;
            }
        }
        assert!(counts.iter().all(|&c| c == 1));
        assert!(queue.is_empty());
    }
}
