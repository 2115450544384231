//! Bounded lock-free queues between the realtime thread and everything else.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
}

/// A bounded lock-free queue shared by cloning. Neither side ever blocks.
pub struct EventQueue<T> {
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), QueueError> {
        self.queue.push(value).map_err(|_| QueueError::Full)
    }

    /// Pushes `value`, evicting and returning the oldest element when full.
    pub fn force_push(&self, value: T) -> Option<T> {
        self.queue.force_push(value)
    }

    pub fn try_pop(&self) -> Result<T, QueueError> {
        self.queue.pop().ok_or(QueueError::Empty)
    }

    /// Pops until the queue is empty or `f` has seen `limit` elements.
    pub fn drain_into<F: FnMut(T)>(&self, limit: usize, mut f: F) -> usize {
        let mut count = 0;
        while count < limit {
            match self.queue.pop() {
                Some(value) => {
                    f(value);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
