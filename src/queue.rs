//! Bounded FIFO queue for pipeline flow control.
//!
//! Each stage boundary in the pipeline is one `BoundedQueue`. The queue
//! enforces an item-count capacity: a non-blocking push against a full queue
//! is a signalled refusal, not an error, and callers treat it as expected
//! backpressure. Blocking variants suspend on a condvar until capacity or
//! data is available, or until the queue is closed.
//!
//! # Close semantics
//!
//! `close()` wakes every blocked waiter and makes all subsequent waits fail.
//! Items already queued remain poppable via the non-blocking accessors until
//! `clear()` discards them; this is what lets `stop()` unblock boundary
//! callers deterministically.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Running count of completed pops. FIFO order makes this the arrival
    /// ordinal of the popped item, which multi-threaded stage groups use as
    /// their reorder serial.
    pop_count: u64,
}

/// A thread-safe FIFO queue with a fixed capacity.
///
/// Safe for concurrent multi-producer/multi-consumer access; FIFO order is
/// preserved per queue. Capacity is fixed at construction.
pub struct BoundedQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                pop_count: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Push without waiting.
    ///
    /// Returns the item back if the queue is full or closed. A full queue is
    /// backpressure, not failure; the caller decides whether to retry.
    pub fn try_push(&self, item: T) -> std::result::Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.items.len() >= self.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, blocking until space is available or the queue is closed.
    ///
    /// Returns the item back only if the queue was closed before the push
    /// could complete.
    pub fn wait_push(&self, item: T) -> std::result::Result<(), T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.items.len() >= self.capacity {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop without waiting. Returns `None` if the queue is empty.
    ///
    /// Popping from a closed queue still drains remaining items.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front()?;
        inner.pop_count += 1;
        drop(inner);
        self.not_full.notify_one();
        Some(item)
    }

    /// Pop without waiting, returning the pop ordinal alongside the item.
    ///
    /// The ordinal counts completed pops on this queue; because pops are
    /// FIFO it equals the item's arrival order, making it usable as a
    /// reorder serial when several threads drain the same queue.
    pub fn try_pop_tagged(&self) -> Option<(u64, T)> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front()?;
        let tag = inner.pop_count;
        inner.pop_count += 1;
        drop(inner);
        self.not_full.notify_one();
        Some((tag, item))
    }

    /// Pop, blocking until an item is available or the queue is closed.
    ///
    /// Returns `None` only if the queue was closed and fully drained.
    pub fn wait_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.items.is_empty() {
            self.not_empty.wait(&mut inner);
        }
        let item = inner.items.pop_front()?;
        inner.pop_count += 1;
        drop(inner);
        self.not_full.notify_one();
        Some(item)
    }

    /// Close the queue, waking every blocked pusher and popper.
    ///
    /// Blocked waits fail once woken; queued items stay poppable until
    /// `clear()`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Discard all queued items.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// The fixed capacity set at construction.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &inner.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}
