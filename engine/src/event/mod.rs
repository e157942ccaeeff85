pub mod command;
pub mod stream;
pub mod subscriber;

use std::{
    collections::VecDeque,
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use log::warn;

/// An unbounded FIFO shared between producer tasks and the consumer thread.
///
/// Every item handed out by [`get`](EventQueue::get) counts as unfinished until the consumer
/// acknowledges it with [`task_done`](EventQueue::task_done), which is what [`join`](EventQueue::join)
/// waits on. There is no redelivery, an item taken by a consumer that dies is lost.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    all_done: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    unfinished: usize,
    closed: bool,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    unfinished: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                all_done: Condvar::new(),
            }),
        }
    }

    // A panic while the lock was held cannot leave the state half-updated, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed(item));
        }

        state.items.push_back(item);
        state.unfinished += 1;
        drop(state);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut state = self.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }

            if state.closed {
                return None;
            }

            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    #[cfg(test)]
    pub fn try_get(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    pub fn task_done(&self) {
        let mut state = self.lock();

        if state.unfinished == 0 {
            warn!("task_done called more times than there were items in the queue");
            return;
        }

        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.shared.all_done.notify_all();
        }
    }

    /// Blocks until every item put so far has been acknowledged.
    #[cfg(test)]
    pub fn join(&self) {
        let mut state = self.lock();

        while state.unfinished > 0 {
            state = self
                .shared
                .all_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Items waiting to be taken.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items put but not yet acknowledged, including those a consumer is working on.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }

    /// Rejects further puts and wakes blocked consumers. Items already queued can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`EventQueue::put`] after the queue was closed, carrying the rejected item.
pub struct QueueClosed<T>(pub T);

impl<T> Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> Display for QueueClosed<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("event queue is closed")
    }
}

impl<T> Error for QueueClosed<T> {}
