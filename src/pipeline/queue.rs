//! Bounded FIFO with blocking dequeue.
//!
//! Used for client buffers waiting to be processed and for pool buffers
//! waiting to be (re)submitted to the device. Dequeue on an empty queue is the
//! pipeline's main blocking point; flush and teardown wake every waiter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a blocking dequeue.
#[derive(Debug)]
pub enum Dequeue<T> {
    Item(T),
    Timeout,
    /// A flush is in progress; abort the current cycle.
    Flushing,
    /// The queue was closed for teardown.
    Closed,
}

impl<T> Dequeue<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            Dequeue::Item(item) => Some(item),
            _ => None,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    flushing: bool,
    closed: bool,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                flushing: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Add an item at the tail.
    ///
    /// Hands the item back when the queue is full, flushing or closed so the
    /// caller can route it elsewhere instead of losing it.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.flushing || inner.closed || inner.items.len() >= inner.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Oldest item, waiting up to `timeout` for one to arrive.
    pub fn dequeue_blocking(&self, timeout: Duration) -> Dequeue<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Dequeue::Closed;
            }
            if inner.flushing {
                return Dequeue::Flushing;
            }
            if let Some(item) = inner.items.pop_front() {
                return Dequeue::Item(item);
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return match inner.items.pop_front() {
                    Some(item) if !inner.flushing && !inner.closed => Dequeue::Item(item),
                    Some(item) => {
                        inner.items.push_front(item);
                        Dequeue::Timeout
                    }
                    None => Dequeue::Timeout,
                };
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.flushing || inner.closed {
            return None;
        }
        inner.items.pop_front()
    }

    /// Put an item back at the head, ignoring capacity.
    ///
    /// Used when a stage has to abandon an item it just dequeued.
    pub fn requeue_front(&self, item: T) {
        self.inner.lock().items.push_front(item);
        self.ready.notify_one();
    }

    /// Drain everything. Items are returned so they can be handed back.
    pub fn reset(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.items.drain(..).collect()
    }

    /// Enter flush: reject enqueues, wake waiters, drain and return the contents.
    ///
    /// Enqueue and drain happen under the same lock, so an item either made it
    /// in before the flush (and is returned here) or is handed back to its
    /// producer.
    pub fn begin_flush(&self) -> Vec<T> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.flushing = true;
            inner.items.drain(..).collect()
        };
        self.ready.notify_all();
        drained
    }

    pub fn end_flush(&self) {
        self.inner.lock().flushing = false;
        self.ready.notify_all();
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.lock().flushing
    }

    /// Wake every waiter permanently; used at teardown.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        inner.closed = false;
        inner.flushing = false;
    }

    /// Wake waiters without changing state so they re-check their conditions.
    pub fn kick(&self) {
        self.ready.notify_all();
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
