//! The outcome of one unit of deferred work.
//!
//! An [`AsyncResult`] pairs a [`WaitHandle`] with a slot for the value a
//! deferred operation will eventually produce. The producer side completes
//! the result exactly once; any number of consumer-side clones may poll it
//! with [`AsyncResult::has_completed`] or block on it with
//! [`AsyncResult::block_until_complete`].
//!
//! Results created by the core-thread machinery carry a reference to the
//! task scheduler. While such a result is blocked on, it lends one unit of
//! worker capacity back to the pool so that a thread spending its time
//! waiting does not shrink effective parallelism.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ForgeError;
use crate::scheduler::{CapacityLease, CapacityLender};
use crate::wait_handle::WaitHandle;

/// State shared between all clones of one result.
struct ResultState<T> {
    cell: Mutex<ResultCell<T>>,
    handle: WaitHandle,
}

struct ResultCell<T> {
    completed: bool,
    value: Option<T>,
}

/// A handle to the outcome of one deferred operation.
///
/// Transitions from incomplete to completed exactly once. Reading the value
/// before completion is an error; a result whose operation was cancelled is
/// never completed at all, so callers that may race a cancellation should
/// wait with a timeout.
pub struct AsyncResult<T = ()> {
    state: Arc<ResultState<T>>,
    lender: Option<Arc<dyn CapacityLender>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        AsyncResult {
            state: Arc::clone(&self.state),
            lender: self.lender.clone(),
        }
    }
}

impl<T> AsyncResult<T> {
    /// Creates a new incomplete result.
    pub fn new() -> AsyncResult<T> {
        Self::with_lender(None)
    }

    /// Creates a new incomplete result that lends pool capacity through
    /// `lender` while a thread is blocked on it.
    pub(crate) fn with_lender(lender: Option<Arc<dyn CapacityLender>>) -> AsyncResult<T> {
        AsyncResult {
            state: Arc::new(ResultState {
                cell: Mutex::new(ResultCell {
                    completed: false,
                    value: None,
                }),
                handle: WaitHandle::new(),
            }),
            lender,
        }
    }

    /// Returns `true` once the operation has completed.
    pub fn has_completed(&self) -> bool {
        self.state.cell.lock().completed
    }

    /// Blocks the calling thread until the operation completes.
    pub fn block_until_complete(&self) {
        if self.has_completed() {
            return;
        }

        match &self.lender {
            Some(lender) => {
                let _lease = CapacityLease::acquire(lender.as_ref());
                self.state.handle.wait();
            }
            None => self.state.handle.wait(),
        }
    }

    /// Like [`AsyncResult::block_until_complete`] but gives up after
    /// `timeout`. Returns `true` if the operation completed.
    pub fn block_until_complete_timeout(&self, timeout: std::time::Duration) -> bool {
        if self.has_completed() {
            return true;
        }

        match &self.lender {
            Some(lender) => {
                let _lease = CapacityLease::acquire(lender.as_ref());
                self.state.handle.wait_timeout(timeout)
            }
            None => self.state.handle.wait_timeout(timeout),
        }
    }

    /// Takes the value produced by the operation.
    ///
    /// Fails with [`ForgeError::ResultNotReady`] before completion and with
    /// [`ForgeError::ResultAlreadyTaken`] if the value was already removed
    /// by an earlier call.
    pub fn value(&self) -> Result<T, ForgeError> {
        let mut cell = self.state.cell.lock();
        if !cell.completed {
            return Err(ForgeError::ResultNotReady);
        }
        cell.value.take().ok_or(ForgeError::ResultAlreadyTaken)
    }

    /// Completes the result with `value` and wakes every waiter.
    ///
    /// A result completes at most once; late attempts are dropped so that a
    /// race between two completers cannot tear the stored value.
    pub(crate) fn complete(&self, value: T) {
        {
            let mut cell = self.state.cell.lock();
            if cell.completed {
                log::warn!("async result completed more than once; ignoring later value");
                return;
            }
            cell.value = Some(value);
            cell.completed = true;
        }
        self.state.handle.set();
    }
}

impl AsyncResult<()> {
    /// Completes a value-less result.
    pub(crate) fn complete_empty(&self) {
        self.complete(());
    }
}

impl<T> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::new()
    }
}
