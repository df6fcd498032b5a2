//! Ordered buffers of commands awaiting playback on the core thread.
//!
//! A [`CommandQueue`] stores commands in insertion order and hands them out
//! again with a flush-and-swap: [`CommandQueue::flush`] atomically takes the
//! current contents and leaves a fresh buffer behind, so producers can keep
//! enqueuing while an older batch is replayed.
//!
//! The queue is generic over a synchronization policy:
//!
//! + [`Synced`] is valid from any thread and is used for the core thread's
//!   shared internal queue.
//! + [`Unsynced`] is the fast path for thread-owned deferred queues. In
//!   debug builds it asserts that producer-side operations come from the
//!   owning thread; violating that affinity is a fatal programming error.
//!
//! Both policies keep the command list behind one narrow mutex, which is
//! what makes the flush atomic with respect to concurrent enqueues. The
//! policy contributes only the access guard, not separate queue behavior.

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::error;
use parking_lot::{Mutex, MutexGuard};

use crate::async_result::AsyncResult;
use crate::scheduler::CapacityLender;

// -----------------------------------------------------------------------------
// Commands

/// One queued unit of work: a callable plus the completion side of the
/// [`AsyncResult`] handed back to the producer.
///
/// A command completes its result exactly once, when executed. A command
/// dropped without executing (see [`CommandQueue::cancel_all`]) never
/// completes its result; the producer's handle is abandoned, not failed.
pub struct Command {
    exec: Box<dyn FnOnce() + Send>,
    callback_id: u32,
}

impl Command {
    /// Runs the command body and completes its result.
    pub fn execute(self) {
        (self.exec)();
    }

    /// Identifier assigned by the queue this command was enqueued on.
    pub fn callback_id(&self) -> u32 {
        self.callback_id
    }
}

// -----------------------------------------------------------------------------
// Synchronization policies

/// Selects how a [`CommandQueue`] guards producer-side access.
pub trait QueuePolicy: Send + Sync + 'static {
    /// Creates the policy for a queue owned by `owner`.
    fn new(owner: ThreadId) -> Self;

    /// Checks that the calling thread may touch the queue. Fatal (debug
    /// builds) when the check fails.
    fn validate_access(&self);
}

/// Policy for queues shared between threads. Every access goes through the
/// queue's mutex, so any thread is a valid caller.
pub struct Synced;

impl QueuePolicy for Synced {
    fn new(_owner: ThreadId) -> Synced {
        Synced
    }

    #[inline]
    fn validate_access(&self) {}
}

/// Policy for queues owned by a single producer thread. Trades the safety of
/// [`Synced`] for an uncontended fast path; debug builds fail fast when
/// another thread enqueues.
pub struct Unsynced {
    owner: ThreadId,
}

impl QueuePolicy for Unsynced {
    fn new(owner: ThreadId) -> Unsynced {
        Unsynced { owner }
    }

    #[inline]
    fn validate_access(&self) {
        #[cfg(debug_assertions)]
        if thread::current().id() != self.owner {
            error!(
                "command queue owned by {:?} accessed from {:?}",
                self.owner,
                thread::current().id()
            );
            panic!("command queue accessed outside of its owning thread");
        }
    }
}

// -----------------------------------------------------------------------------
// Command queue

/// An ordered buffer of commands with a flush-and-swap drain operation.
/// Insertion order is execution order.
pub struct CommandQueue<P: QueuePolicy> {
    policy: P,
    commands: Mutex<Vec<Command>>,
    next_callback_id: AtomicU32,
}

impl<P: QueuePolicy> CommandQueue<P> {
    /// Creates an empty queue owned by the calling thread.
    pub fn new() -> CommandQueue<P> {
        CommandQueue {
            policy: P::new(thread::current().id()),
            commands: Mutex::new(Vec::new()),
            next_callback_id: AtomicU32::new(0),
        }
    }

    /// Appends a command to the tail of the queue. Returns a handle the
    /// producer can later block on.
    pub fn enqueue<F>(&self, f: F) -> AsyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_with(f, None)
    }

    /// Appends a value-producing command to the tail of the queue.
    pub fn enqueue_returning<T, F>(&self, f: F) -> AsyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue_returning_with(f, None)
    }

    pub(crate) fn enqueue_with<F>(
        &self,
        f: F,
        lender: Option<Arc<dyn CapacityLender>>,
    ) -> AsyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.policy.validate_access();

        let result = AsyncResult::with_lender(lender);
        let completer = result.clone();
        self.push(Box::new(move || {
            f();
            completer.complete_empty();
        }));
        result
    }

    pub(crate) fn enqueue_returning_with<T, F>(
        &self,
        f: F,
        lender: Option<Arc<dyn CapacityLender>>,
    ) -> AsyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.policy.validate_access();

        let result = AsyncResult::with_lender(lender);
        let completer = result.clone();
        self.push(Box::new(move || {
            let value = f();
            completer.complete(value);
        }));
        result
    }

    fn push(&self, exec: Box<dyn FnOnce() + Send>) {
        let callback_id = self.next_callback_id();
        self.commands.lock().push(Command { exec, callback_id });
    }

    /// Atomically takes the queued commands, leaving a fresh buffer for
    /// subsequent enqueues. Callers never observe a partially-flushed queue.
    pub fn flush(&self) -> Vec<Command> {
        mem::take(&mut *self.commands.lock())
    }

    /// Drops every queued command without executing it. The results already
    /// handed out for those commands are never completed; callers must treat
    /// them as abandoned, not failed.
    pub fn cancel_all(&self) {
        self.policy.validate_access();
        self.commands.lock().clear();
    }

    /// Returns `true` if no commands are queued.
    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Number of commands currently queued.
    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Generates a queue-unique callback identifier.
    pub fn next_callback_id(&self) -> u32 {
        self.next_callback_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Executes a flushed batch in FIFO order.
    pub fn playback(commands: Vec<Command>) {
        for command in commands {
            command.execute();
        }
    }
}

impl CommandQueue<Synced> {
    /// Grants the core thread direct access to the command buffer so its
    /// consumer loop can pair the queue's mutex with a condition variable.
    pub(crate) fn lock_commands(&self) -> MutexGuard<'_, Vec<Command>> {
        self.commands.lock()
    }
}

impl<P: QueuePolicy> Default for CommandQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}
