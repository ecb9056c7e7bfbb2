//! Bounded queue between a capture producer and the dissection consumer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// What a full queue does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the oldest queued item. The producer never waits.
    #[default]
    DropOldest,
    /// Wait for the consumer. Nothing is lost.
    Block,
}

/// Result of [`FrameQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item.
    DroppedOldest,
    /// The queue is closed; the item was discarded.
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Fixed-capacity FIFO shared by one producer and one consumer thread.
pub struct FrameQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> FrameQueue<T> {
    /// Create a queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let mut state = self.lock();
        let mut outcome = PushOutcome::Queued;
        loop {
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.items.len() < self.capacity {
                break;
            }
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    state.dropped += 1;
                    outcome = PushOutcome::DroppedOldest;
                    break;
                }
                OverflowPolicy::Block => {
                    state = self.not_full.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        outcome
    }

    /// Next item, blocking while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting items. Queued items can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Close and discard everything queued.
    pub fn abandon(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.items.clear();
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    // Test 1: Overflow drops the oldest item
    #[test]
    fn test_drop_oldest() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Queued);
        assert_eq!(queue.push(3), PushOutcome::DroppedOldest);
        assert_eq!(queue.dropped(), 1);
        queue.close();
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    // Test 2: Blocking producer resumes when the consumer pops
    #[test]
    fn test_block_policy() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        queue.push(1);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.dropped(), 0);
    }

    // Test 3: Closing wakes a waiting consumer and rejects pushes
    #[test]
    fn test_close() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new(4, OverflowPolicy::Block));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(queue.push(1), PushOutcome::Closed);
    }

    // Test 4: Abandoning discards queued items and unblocks the producer
    #[test]
    fn test_abandon() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        queue.push(1);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        queue.abandon();
        assert_eq!(producer.join().unwrap(), PushOutcome::Closed);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
