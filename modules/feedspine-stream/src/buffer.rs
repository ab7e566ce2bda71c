//! Bounded async buffer with cooperative backpressure.
//!
//! Producers `put`, the consumer `get`s. When the queue is at capacity,
//! `put` suspends until the consumer drains; when the queue is empty,
//! `get` suspends until a producer fills or the buffer is marked done.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::Notify;

/// `put` was called after `mark_done`. The item comes back to the caller.
#[derive(PartialEq, Eq)]
pub struct BufferDone<T>(pub T);

impl<T> fmt::Debug for BufferDone<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BufferDone")
    }
}

impl<T> fmt::Display for BufferDone<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("buffer is marked done")
    }
}

impl<T> std::error::Error for BufferDone<T> {}

struct Inner<T> {
    queue: VecDeque<T>,
    done: bool,
}

pub struct AsyncBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    /// Signaled when a slot frees up or the buffer is marked done.
    space: Notify,
    /// Signaled when an item arrives or the buffer is marked done.
    items: Notify,
}

impl<T> AsyncBuffer<T> {
    /// `capacity` must be >= 1; zero is clamped up.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                done: false,
            }),
            capacity: capacity.max(1),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered items right now. Never exceeds `capacity`.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().expect("buffer lock poisoned").done
    }

    /// Enqueue one item, suspending while the buffer is full.
    pub async fn put(&self, item: T) -> Result<(), BufferDone<T>> {
        loop {
            // Created before the slot check: a notify that races the
            // unlock is held as a permit, not lost.
            let notified = self.space.notified();
            {
                let mut inner = self.inner.lock().expect("buffer lock poisoned");
                if inner.done {
                    return Err(BufferDone(item));
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(item);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            notified.await;
            // Loop and retry; another producer may have taken the slot.
        }
    }

    /// Dequeue the next item. Returns None once the buffer is done and
    /// drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.items.notified();
            {
                let mut inner = self.inner.lock().expect("buffer lock poisoned");
                if let Some(item) = inner.queue.pop_front() {
                    self.space.notify_one();
                    return Some(item);
                }
                if inner.done {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Declare the producer side finished. Idempotent. After this
    /// returns, every `put` fails and `get` drains then yields None.
    pub fn mark_done(&self) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.done = true;
        drop(inner);
        // Wake every waiter: blocked producers must observe done and
        // error out, the consumer must observe done once drained.
        self.space.notify_waiters();
        self.items.notify_waiters();
    }
}
