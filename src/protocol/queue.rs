//! Thread-safe double-ended queue with blocking waits.
//!
//! [`BlockingQueue`] is the hand-off point between the I/O thread and the application thread.
//! Every connection owns one for its pending writes, and every endpoint shares one between all
//! of its connections for completed inbound messages.
//!
//! All operations take the same lock. Pushes signal one waiter, so a consumer parked in
//! [`BlockingQueue::wait`] or [`BlockingQueue::wait_for`] observes new items without polling.
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
}

#[derive(Debug)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_back(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    pub fn push_front(&self, item: T) {
        self.lock().push_front(item);
        self.available.notify_one();
    }

    /// Appends `item` and reports whether the queue was empty beforehand.
    ///
    /// Both happen under one lock acquisition, so exactly one of several racing producers
    /// observes the empty-to-busy transition.
    pub(crate) fn push_back_was_empty(&self, item: T) -> bool {
        let mut items = self.lock();
        let was_empty = items.is_empty();
        items.push_back(item);
        drop(items);

        self.available.notify_one();
        was_empty
    }

    pub fn pop_front(&self) -> Result<T, QueueError> {
        self.lock().pop_front().ok_or(QueueError::Empty)
    }

    pub fn pop_back(&self) -> Result<T, QueueError> {
        self.lock().pop_back().ok_or(QueueError::Empty)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Blocks the calling thread until the queue holds at least one item.
    pub fn wait(&self) {
        let items = self.lock();
        let _items = self
            .available
            .wait_while(items, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Blocks until the queue is non-empty or `timeout` elapses.
    ///
    /// Returns `true` if an item is available.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let items = self.lock();
        let (items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !items.is_empty()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> BlockingQueue<T> {
    pub fn front(&self) -> Result<T, QueueError> {
        self.lock().front().cloned().ok_or(QueueError::Empty)
    }

    pub fn back(&self) -> Result<T, QueueError> {
        self.lock().back().cloned().ok_or(QueueError::Empty)
    }
}
