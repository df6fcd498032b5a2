//! Ignite-once/shutdown-once lifecycle tracking.
//!
//! The three long-lived context objects ([`CoreThread`], [`ThreadPool`] and
//! [`TaskScheduler`]) share the same construct-then-initialize convention:
//! `ignite` may be called exactly once, `shutdown` exactly once and only
//! after ignition. Calling either out of order means the program is already
//! in an unknown threading state, so the violation is fatal rather than
//! recoverable.
//!
//! [`CoreThread`]: crate::core_thread::CoreThread
//! [`ThreadPool`]: crate::thread_pool::ThreadPool
//! [`TaskScheduler`]: crate::scheduler::TaskScheduler

use log::error;
use parking_lot::Mutex;

/// The phases a lifecycle-managed object moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed but not yet initialized.
    Created,
    /// `ignite` has run; the object is live.
    Ignited,
    /// `shutdown` has run; the object must not be used again.
    ShutDown,
}

/// Tracks the lifecycle state of one module-like object.
pub(crate) struct Lifecycle {
    name: &'static str,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Lifecycle {
        Lifecycle {
            name,
            state: Mutex::new(LifecycleState::Created),
        }
    }

    /// Moves `Created -> Ignited`. Fatal if the object was already ignited
    /// or shut down.
    pub fn mark_ignited(&self) {
        let mut state = self.state.lock();
        if *state != LifecycleState::Created {
            error!(
                "{}: ignite called in state {:?}, expected Created",
                self.name, *state
            );
            panic!("{}: ignite called more than once", self.name);
        }
        *state = LifecycleState::Ignited;
    }

    /// Moves `Ignited -> ShutDown`. Fatal if the object was never ignited or
    /// was already shut down.
    pub fn mark_shut_down(&self) {
        let mut state = self.state.lock();
        if *state != LifecycleState::Ignited {
            error!(
                "{}: shutdown called in state {:?}, expected Ignited",
                self.name, *state
            );
            panic!("{}: shutdown called out of order", self.name);
        }
        *state = LifecycleState::ShutDown;
    }

    /// Fatal unless the object is currently live.
    pub fn assert_ignited(&self) {
        let state = self.state.lock();
        if *state != LifecycleState::Ignited {
            error!("{}: used in state {:?}, expected Ignited", self.name, *state);
            panic!("{}: used while not ignited", self.name);
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }
}
