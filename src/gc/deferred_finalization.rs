//! Deferred finalization queue for collector passes.
//!
//! ## Problem
//!
//! A collector pass walks the handle table while holding a borrow of it.
//! Weak callbacks call back into the adapter (to clear internal fields,
//! release handles, report memory), which needs that same borrow.
//!
//! ## Solution
//!
//! During the pass, unreachable handles are freed and their callbacks queued
//! here. Once the table borrow is released, the queue is drained.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::adapter::WeakCallback;

/// Queue of weak callbacks waiting to run.
pub struct DeferredFinalizers {
    queue: RefCell<VecDeque<WeakCallback>>,

    /// Total callbacks run so far
    processed: Cell<u64>,
}

impl Default for DeferredFinalizers {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredFinalizers {
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::with_capacity(8)),
            processed: Cell::new(0),
        }
    }

    /// Queue a callback to run on the next `process_all()`.
    pub fn defer(&self, callback: WeakCallback) {
        self.queue.borrow_mut().push_back(callback);
        tracing::trace!("Deferred weak callback (pending: {})", self.len());
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Total callbacks run over the queue's lifetime.
    pub fn processed(&self) -> u64 {
        self.processed.get()
    }

    /// Run every pending callback, including ones queued while draining.
    ///
    /// Returns the number of callbacks run.
    pub fn process_all(&self) -> usize {
        let mut count = 0;

        loop {
            // Take the batch so callbacks may defer more work
            let batch = std::mem::take(&mut *self.queue.borrow_mut());

            if batch.is_empty() {
                break;
            }

            for callback in batch {
                callback();
                count += 1;
            }
        }

        if count > 0 {
            self.processed.set(self.processed.get() + count as u64);
            tracing::trace!("Processed {} deferred weak callbacks", count);
        }

        count
    }
}

impl std::fmt::Debug for DeferredFinalizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredFinalizers")
            .field("pending", &self.len())
            .field("processed", &self.processed.get())
            .finish()
    }
}
