//! Bounded transfer queue
//!
//! A thin wrapper over a bounded crossbeam channel shared by the loader
//! (writer) and the upload workers (readers, and writers again on retry).
//! Capacity gives backpressure: a full queue blocks producers instead of
//! letting staged artifacts pile up on disk.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Interval at which a blocked `put` rechecks the cancellation flag
const PUT_RETRY_WAIT: Duration = Duration::from_millis(200);

pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Block until the item is enqueued, rechecking `cancel` periodically.
    ///
    /// Returns the item back to the caller on cancellation so owned staging
    /// artifacts can be cleaned up.
    pub fn put(&self, item: T, cancel: &AtomicBool) -> Result<(), T> {
        self.put_unless(item, || cancel.load(Ordering::Relaxed))
    }

    /// Like `put`, but gives up (returning the item) whenever `abort`
    /// reports true. Producers use this to stop once no consumer is left.
    pub fn put_unless(&self, item: T, abort: impl Fn() -> bool) -> Result<(), T> {
        let mut item = item;
        loop {
            if abort() {
                return Err(item);
            }
            match self.tx.send_timeout(item, PUT_RETRY_WAIT) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(back)) => return Err(back),
            }
        }
    }

    /// Wait up to `timeout` for an item; `None` lets callers recheck their
    /// termination condition instead of blocking forever.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
