//! Bounded FIFO rendezvous between worker threads and the consumer.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A bounded multi-producer/multi-consumer queue with close semantics.
///
/// `close` is the shutdown edge of the whole sampler: it wakes every blocked
/// producer and consumer, and from that point on `push` and `pop` fail
/// immediately. Items still buffered at close time are intentionally not
/// delivered; whoever closed the queue has already decided the terminal
/// status the consumer should see instead.
pub struct SampleQueue<T> {
    state: Mutex<QueueState<T>>,
    can_push: Condvar,
    can_pop: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> SampleQueue<T> {
    /// Creates a queue holding at most `capacity` items. A capacity of zero
    /// is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
            }),
            can_push: Condvar::new(),
            can_pop: Condvar::new(),
        }
    }

    /// Blocks until there is room or the queue is closed. Returns `false`
    /// iff the queue was closed before the item could be inserted.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.items.len() == state.capacity && !state.closed {
            state = self.can_push.wait(state).unwrap();
        }
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.can_pop.notify_one();
        true
    }

    /// Blocks until an item arrives or the queue is closed. Returns `None`
    /// once closed, even if undelivered items remain.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() && !state.closed {
            state = self.can_pop.wait(state).unwrap();
        }
        if state.closed {
            return None;
        }
        let item = state.items.pop_front();
        drop(state);
        self.can_push.notify_one();
        item
    }

    /// Closes the queue and wakes all waiters. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.can_push.notify_all();
        self.can_pop.notify_all();
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
