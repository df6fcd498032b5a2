//! The command pipeline feeding one designated consumer thread.
//!
//! A [`CoreThread`] serializes work onto the thread that called
//! [`CoreThread::ignite`] (typically the thread that owns a render context
//! or other single-threaded resource). Producers on any thread buffer
//! commands into a per-thread [`Unsynced`] queue and later [`submit`] the
//! whole buffer, which moves the batch onto the shared internal queue as a
//! single unit; the consumer loop ([`CoreThread::run`]) drains that internal
//! queue FIFO. Urgent work can skip the buffering stage with
//! [`QueueFlags::INTERNAL_QUEUE`].
//!
//! While the consumer has nothing to do it parks on a condition variable
//! and lends one unit of worker capacity to the task scheduler, so an idle
//! core thread still contributes to overall parallelism.
//!
//! A panicking command body is not caught; it unwinds out of [`run`] on the
//! consumer thread.
//!
//! [`submit`]: CoreThread::submit
//! [`run`]: CoreThread::run
//! [`Unsynced`]: crate::command_queue::Unsynced

use std::cell::RefCell;
use std::mem;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::async_result::AsyncResult;
use crate::command_queue::{Command, CommandQueue, Synced, Unsynced};
use crate::lifecycle::Lifecycle;
use crate::scheduler::{CapacityLease, CapacityLender, TaskScheduler};

// -----------------------------------------------------------------------------
// Queue flags

/// Flags controlling where a command goes and whether the producer waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFlags(u8);

impl QueueFlags {
    /// Buffer into the calling thread's private queue; runs only after a
    /// later `submit`.
    pub const DEFAULT: QueueFlags = QueueFlags(0);
    /// Append directly to the shared internal queue and wake the consumer.
    pub const INTERNAL_QUEUE: QueueFlags = QueueFlags(1 << 0);
    /// Block the producer until the command has executed. Only meaningful
    /// together with [`QueueFlags::INTERNAL_QUEUE`].
    pub const BLOCK_UNTIL_COMPLETE: QueueFlags = QueueFlags(1 << 1);

    /// Returns `true` if every flag in `other` is set in `self`.
    pub fn contains(self, other: QueueFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueueFlags {
    type Output = QueueFlags;

    fn bitor(self, rhs: QueueFlags) -> QueueFlags {
        QueueFlags(self.0 | rhs.0)
    }
}

// -----------------------------------------------------------------------------
// Per-thread queues

/// One producer thread's private command buffer.
struct ThreadQueue {
    queue: CommandQueue<Unsynced>,
    /// Set on the queue belonging to the ignition thread; `submit_all`
    /// flushes it last.
    is_main: bool,
}

/// Monotonic id per `CoreThread` instance. Never reused, unlike an
/// allocation address, so a stale cache entry can never alias a newer
/// instance.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Cache of this thread's queue per `CoreThread` instance, keyed by the
    /// instance id. Lets repeat producers skip the registry lock.
    static THREAD_QUEUES: RefCell<Vec<(u64, Arc<ThreadQueue>)>> = RefCell::new(Vec::new());
}

// -----------------------------------------------------------------------------
// Core thread

/// Context object for the command pipeline. Created once on the thread that
/// will consume commands; shared with producers via `Arc`.
pub struct CoreThread {
    lifecycle: Lifecycle,
    instance_id: u64,
    /// The ignition thread; the only thread allowed to run the consumer
    /// loop.
    core_thread_id: ThreadId,
    internal: CommandQueue<Synced>,
    /// Paired with the internal queue's command lock.
    command_ready: Condvar,
    /// Written under the internal queue's command lock so the consumer
    /// cannot miss the final wake.
    shutdown_flag: AtomicBool,
    registry: Mutex<Vec<Arc<ThreadQueue>>>,
    /// Serializes `submit` and `submit_all` against each other.
    submit_lock: Mutex<()>,
    scheduler: Arc<TaskScheduler>,
}

impl CoreThread {
    /// Creates the core thread context, recording the calling thread as the
    /// consumer. [`CoreThread::run`] must later be called on this same
    /// thread.
    pub fn ignite(scheduler: Arc<TaskScheduler>) -> Arc<CoreThread> {
        let lifecycle = Lifecycle::new("CoreThread");
        lifecycle.mark_ignited();

        let core_thread_id = thread::current().id();
        info!("core thread ignited on {core_thread_id:?}");

        Arc::new(CoreThread {
            lifecycle,
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            core_thread_id,
            internal: CommandQueue::new(),
            command_ready: Condvar::new(),
            shutdown_flag: AtomicBool::new(false),
            registry: Mutex::new(Vec::new()),
            submit_lock: Mutex::new(()),
            scheduler,
        })
    }

    /// Returns `true` when called from the consumer thread.
    pub fn is_core_thread(&self) -> bool {
        thread::current().id() == self.core_thread_id
    }

    /// Queues a command according to `flags`. The default path buffers into
    /// the calling thread's private queue; [`QueueFlags::INTERNAL_QUEUE`]
    /// goes straight to the consumer.
    pub fn queue_command<F>(self: &Arc<Self>, f: F, flags: QueueFlags) -> AsyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.assert_ignited();

        if flags.contains(QueueFlags::INTERNAL_QUEUE) {
            let result = self.internal.enqueue_with(f, Some(self.lender()));
            self.command_ready.notify_all();

            if flags.contains(QueueFlags::BLOCK_UNTIL_COMPLETE) {
                self.assert_not_core_thread();
                result.block_until_complete();
            }
            result
        } else {
            if flags.contains(QueueFlags::BLOCK_UNTIL_COMPLETE) {
                warn!("BLOCK_UNTIL_COMPLETE ignored for a buffered command; it only applies to INTERNAL_QUEUE");
            }
            self.thread_queue().queue.enqueue(f)
        }
    }

    /// Like [`CoreThread::queue_command`] for commands that produce a value.
    pub fn queue_returning_command<T, F>(self: &Arc<Self>, f: F, flags: QueueFlags) -> AsyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.lifecycle.assert_ignited();

        if flags.contains(QueueFlags::INTERNAL_QUEUE) {
            let result = self.internal.enqueue_returning_with(f, Some(self.lender()));
            self.command_ready.notify_all();

            if flags.contains(QueueFlags::BLOCK_UNTIL_COMPLETE) {
                self.assert_not_core_thread();
                result.block_until_complete();
            }
            result
        } else {
            if flags.contains(QueueFlags::BLOCK_UNTIL_COMPLETE) {
                warn!("BLOCK_UNTIL_COMPLETE ignored for a buffered command; it only applies to INTERNAL_QUEUE");
            }
            self.thread_queue().queue.enqueue_returning(f)
        }
    }

    /// Flushes the calling thread's buffered commands and moves them onto
    /// the internal queue as one unit, preserving their order. The returned
    /// result completes once the whole batch has executed.
    pub fn submit(self: &Arc<Self>) -> AsyncResult<()> {
        self.lifecycle.assert_ignited();

        let _guard = self.submit_lock.lock();
        let batch = self.thread_queue().queue.flush();
        self.submit_batch(batch)
    }

    /// Flushes every registered thread queue, the ignition thread's queue
    /// last, and moves the combined batch onto the internal queue as one
    /// unit.
    pub fn submit_all(self: &Arc<Self>) -> AsyncResult<()> {
        self.lifecycle.assert_ignited();

        let _guard = self.submit_lock.lock();
        // Make sure the calling thread's own buffer is part of the batch.
        self.thread_queue();

        let queues = self.registry.lock().clone();
        let mut batch = Vec::new();
        for entry in queues.iter().filter(|entry| !entry.is_main) {
            batch.extend(entry.queue.flush());
        }
        for entry in queues.iter().filter(|entry| entry.is_main) {
            batch.extend(entry.queue.flush());
        }
        self.submit_batch(batch)
    }

    /// The consumer loop. Drains the internal queue FIFO; parks (lending
    /// capacity to the scheduler) when the queue is empty; returns once
    /// shutdown has been signalled and the queue is drained.
    ///
    /// Fatal when called from any thread other than the ignition thread.
    /// Remains callable after [`CoreThread::shutdown`] so an already
    /// signalled queue can still be drained.
    pub fn run(&self) {
        if !self.is_core_thread() {
            error!(
                "core thread loop started on {:?}, ignition thread is {:?}",
                thread::current().id(),
                self.core_thread_id
            );
            panic!("core thread loop started off the ignition thread");
        }

        loop {
            let batch = {
                let mut commands = self.internal.lock_commands();
                while commands.is_empty() {
                    if self.shutdown_flag.load(Ordering::Acquire) {
                        info!("core thread loop terminated");
                        return;
                    }
                    let _lease = CapacityLease::acquire(self.scheduler.as_ref());
                    self.command_ready.wait(&mut commands);
                }
                mem::take(&mut *commands)
            };

            CommandQueue::<Synced>::playback(batch);
        }
    }

    /// Signals the consumer loop to exit once its queue is drained.
    pub fn shutdown(&self) {
        self.lifecycle.mark_shut_down();
        {
            let _commands = self.internal.lock_commands();
            self.shutdown_flag.store(true, Ordering::Release);
        }
        self.command_ready.notify_all();
    }

    /// Fatal (debug builds) unless called from the consumer thread.
    pub fn assert_core_thread(&self) {
        #[cfg(debug_assertions)]
        if !self.is_core_thread() {
            error!(
                "operation restricted to the core thread called from {:?}",
                thread::current().id()
            );
            panic!("operation restricted to the core thread");
        }
    }

    /// Fatal (debug builds) when called from the consumer thread. Guards
    /// blocking waits that the consumer itself must fulfil.
    pub fn assert_not_core_thread(&self) {
        #[cfg(debug_assertions)]
        if self.is_core_thread() {
            error!("core thread blocked on a command only it can execute");
            panic!("core thread cannot block on its own queue");
        }
    }

    fn lender(&self) -> Arc<dyn CapacityLender> {
        let scheduler = Arc::clone(&self.scheduler);
        scheduler
    }

    fn submit_batch(&self, batch: Vec<Command>) -> AsyncResult<()> {
        let result = self
            .internal
            .enqueue_with(move || CommandQueue::<Unsynced>::playback(batch), Some(self.lender()));
        self.command_ready.notify_all();
        result
    }

    /// The calling thread's private queue for this core thread, creating
    /// and registering it on first use. The queue made by the ignition
    /// thread is flagged as the main queue.
    fn thread_queue(self: &Arc<Self>) -> Arc<ThreadQueue> {
        let key = self.instance_id;

        let cached = THREAD_QUEUES.with(|cache| {
            cache
                .borrow()
                .iter()
                .find(|(cached_key, _)| *cached_key == key)
                .map(|(_, queue)| Arc::clone(queue))
        });
        if let Some(queue) = cached {
            return queue;
        }

        let queue = Arc::new(ThreadQueue {
            queue: CommandQueue::new(),
            is_main: self.is_core_thread(),
        });
        self.registry.lock().push(Arc::clone(&queue));
        THREAD_QUEUES.with(|cache| {
            cache.borrow_mut().push((key, Arc::clone(&queue)));
        });
        queue
    }
}
