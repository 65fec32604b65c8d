//! Bounded multi-producer multi-consumer ring.
//!
//! The shared timeout service uses a ring of adapter handles to learn which
//! instances have a partially filled vector outstanding, and the ring-backed
//! event device uses one ring per queue. A full ring hands the rejected
//! element back to the caller, so producers keep ownership on backpressure.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A fixed-capacity FIFO safe for concurrent producers and consumers.
#[derive(Debug)]
pub struct Ring<T> {
    /// Entries, guarded for multi-producer/multi-consumer access.
    inner: Mutex<VecDeque<T>>,
    /// Maximum number of entries.
    capacity: usize,
}

impl<T> Ring<T> {
    /// Create a ring holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append one entry. The entry is returned when the ring is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is at capacity.
    pub fn enqueue(&self, item: T) -> std::result::Result<(), T> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.len() >= self.capacity {
            return Err(item);
        }
        inner.push_back(item);
        Ok(())
    }

    /// Remove and return the oldest entry, if any.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.pop_front()
    }

    /// Move up to `max` entries into `out`. Returns the number moved.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let n = max.min(inner.len());
        out.extend(inner.drain(..n));
        n
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether the ring holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
