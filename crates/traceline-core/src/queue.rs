// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity work queue: many producers, one consumer.
//!
//! Telemetry must never apply backpressure to the host application's
//! request path, so `push` fails instead of blocking when the buffer is
//! full. Only the single consumer ever blocks, in `pop`, and only up to an
//! optional timeout.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct QueueInner<T> {
    values: VecDeque<T>,
    /// Monotonic produce/consume counters; `produce - consume` is the
    /// current length and `produce % capacity` the ring offset.
    produce: u64,
    consume: u64,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    capacity: usize,
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> WorkQueue<T> {
        assert!(capacity > 0, "queue capacity must be positive");
        WorkQueue {
            capacity,
            inner: Mutex::new(QueueInner {
                values: VecDeque::with_capacity(capacity),
                produce: 0,
                consume: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        let inner = self.lock();
        (inner.produce - inner.consume) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking. Returns the new length, or `None` when the
    /// queue is full and the message was dropped.
    pub fn push(&self, value: T) -> Option<usize> {
        let mut inner = self.lock();
        let length = (inner.produce - inner.consume) as usize;
        if length == self.capacity {
            return None;
        }

        inner.values.push_back(value);
        inner.produce += 1;
        let length = (inner.produce - inner.consume) as usize;

        // A producer waking the consumer is a signal, not a guarantee; the
        // consumer re-checks under the lock.
        self.available.notify_one();

        Some(length)
    }

    /// Dequeue, blocking up to `timeout` (forever when `None`). Returns
    /// `None` on timeout with the queue still empty.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let mut inner = self.lock();
        let deadline = timeout.map(|t| Instant::now() + t);

        while inner.values.is_empty() {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    inner = guard;
                }
                None => {
                    inner = self
                        .available
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        let value = inner.values.pop_front();
        if value.is_some() {
            inner.consume += 1;
        }
        value
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_up_to_capacity_then_drop() {
        let queue = WorkQueue::new(3);
        assert_eq!(queue.push(1), Some(1));
        assert_eq!(queue.push(2), Some(2));
        assert_eq!(queue.push(3), Some(3));
        // The (capacity+1)th push fails without blocking.
        assert_eq!(queue.push(4), None);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn pop_is_fifo() {
        let queue = WorkQueue::new(8);
        for i in 0..5 {
            queue.push(i);
        }
        for i in 0..5 {
            assert_eq!(queue.pop(Some(Duration::ZERO)), Some(i));
        }
        assert_eq!(queue.pop(Some(Duration::ZERO)), None);
    }

    #[test]
    fn pop_times_out_on_empty() {
        let queue: WorkQueue<u32> = WorkQueue::new(1);
        let started = Instant::now();
        assert_eq!(queue.pop(Some(Duration::from_millis(20))), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn producer_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(10));
        queue.push(42u32);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn drained_queue_accepts_again() {
        let queue = WorkQueue::new(2);
        queue.push('a');
        queue.push('b');
        assert_eq!(queue.push('c'), None);
        assert_eq!(queue.pop(Some(Duration::ZERO)), Some('a'));
        assert_eq!(queue.push('c'), Some(2));
    }

    proptest! {
        #[test]
        fn order_preserved_under_interleaved_ops(ops in prop::collection::vec(any::<bool>(), 1..64)) {
            let queue = WorkQueue::new(16);
            let mut model = std::collections::VecDeque::new();
            let mut next = 0u32;

            for is_push in ops {
                if is_push {
                    if queue.push(next).is_some() {
                        model.push_back(next);
                    } else {
                        prop_assert_eq!(model.len(), 16);
                    }
                    next += 1;
                } else {
                    prop_assert_eq!(queue.pop(Some(Duration::ZERO)), model.pop_front());
                }
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }
}
