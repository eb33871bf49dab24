//! Single-value rendezvous between the prefetch worker and the allocator.

use core::time::Duration;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use portable_atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum HandoffError {
    #[error("hand-off slot closed")]
    Closed,
    #[error("nothing handed off within {0:?}")]
    TimedOut(Duration),
}

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

/// Holds at most one value. A producer placing into an occupied slot waits
/// until the consumer drains it, which caps the prefetch cache at one
/// segment.
pub(crate) struct HandoffSlot<T> {
    slot: Mutex<Slot<T>>,
    filled: Condvar,
    drained: Condvar,
    taken: AtomicU64,
}

impl<T> HandoffSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            filled: Condvar::new(),
            drained: Condvar::new(),
            taken: AtomicU64::new(0),
        }
    }

    /// Places `value`, blocking while the slot is occupied.
    ///
    /// Hands `value` back if the slot was closed.
    pub(crate) fn put(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock();
        while slot.value.is_some() && !slot.closed {
            self.drained.wait(&mut slot);
        }
        if slot.closed {
            return Err(value);
        }
        slot.value = Some(value);
        self.filled.notify_one();
        Ok(())
    }

    /// Removes the pending value, blocking until one is placed.
    ///
    /// A value placed before [`close`](Self::close) is still delivered.
    pub(crate) fn take(&self, timeout: Option<Duration>) -> Result<T, HandoffError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                self.taken.fetch_add(1, Ordering::Relaxed);
                self.drained.notify_one();
                return Ok(value);
            }
            if slot.closed {
                return Err(HandoffError::Closed);
            }
            match deadline {
                Some((at, timeout)) => {
                    if self.filled.wait_until(&mut slot, at).timed_out() && slot.value.is_none() {
                        return Err(HandoffError::TimedOut(timeout));
                    }
                }
                None => self.filled.wait(&mut slot),
            }
        }
    }

    /// Wakes both sides; later puts fail and takes fail once drained.
    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        self.filled.notify_all();
        self.drained.notify_all();
    }

    /// Number of values consumed so far.
    pub(crate) fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn is_occupied(&self) -> bool {
        self.slot.lock().value.is_some()
    }
}
