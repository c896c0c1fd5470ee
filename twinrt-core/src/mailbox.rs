//! Bounded FIFO mailbox
//!
//! A ring buffer that decouples message arrival from processing inside an
//! actor. `put` never waits: a full mailbox reports overflow and the caller
//! picks the backpressure policy. A single exclusive lock guards every field.

use crate::error::MailboxError;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug)]
struct Ring<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

/// Bounded ring buffer of messages
#[derive(Debug)]
pub struct Mailbox<T> {
    inner: Mutex<Ring<T>>,
}

impl<T> Mailbox<T> {
    /// Create a mailbox holding at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                queue: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Append a message, failing when the mailbox is full
    pub fn put(&self, msg: T) -> Result<(), MailboxError> {
        let mut ring = self.inner.lock();
        if ring.queue.len() >= ring.capacity {
            return Err(MailboxError::Overflow {
                capacity: ring.capacity,
            });
        }
        ring.queue.push_back(msg);
        Ok(())
    }

    /// Take the oldest message, if any
    pub fn get(&self) -> Option<T> {
        self.inner.lock().queue.pop_front()
    }

    /// Grow the mailbox. Shrinking is rejected and leaves contents untouched.
    pub fn resize(&self, capacity: usize) -> Result<(), MailboxError> {
        let mut ring = self.inner.lock();
        if capacity < ring.capacity {
            return Err(MailboxError::InvalidResize {
                current: ring.capacity,
                requested: capacity,
            });
        }
        if capacity == ring.capacity {
            return Ok(());
        }

        let additional = capacity - ring.queue.len();
        ring.queue.reserve(additional);
        ring.capacity = capacity;
        Ok(())
    }

    /// Number of queued messages
    pub fn size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}
