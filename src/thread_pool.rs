//! An elastic pool of worker threads with queue-level work stealing.
//!
//! The pool owns two sets of workers. *Permanent* workers are created on
//! demand while the worker count is below the quota. *Temporary* workers are
//! created once the count passes the pool's absolute maximum (which happens
//! when blocked threads lend capacity through
//! [`TaskScheduler::add_worker`](crate::scheduler::TaskScheduler::add_worker))
//! and are reclaimed when load subsides.
//!
//! New work goes to the least-busy worker, preferring a permanent worker on
//! ties. Each [`PooledThread`] runs its own loop over a private queue kept
//! sorted by priority, so priority rank decides execution order within one
//! worker and FIFO breaks ties.
//!
//! Work stealing is not preemptive: only queued-but-not-started items move,
//! and the move is driven from inside a worker's own execution stream via a
//! very-high-priority reclamation task.
//!
//! # Lock order
//!
//! The pool lock is acquired before any worker lock. When two workers'
//! locks are needed at once (work stealing), they are acquired in ascending
//! worker-id order, and the wait-handle maps follow the same rule.
//!
//! # Panics in work bodies
//!
//! A panicking task body is not caught; it propagates out of the worker
//! loop and terminates that worker thread. This is the crate-wide policy
//! for faults inside queued bodies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_utils::CachePadded;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::lifecycle::Lifecycle;
use crate::task::{Task, TaskDesc, TaskPriority, TaskStatus};
use crate::wait_handle::WaitHandle;

/// The pool attempts temporary-worker reclamation every this many least-busy
/// worker lookups.
pub const TEMP_WORKER_CHECK_PERIOD: u32 = 32;

/// Default cap on the pool's permanent worker quota.
pub const DEFAULT_MAX_WORKERS: u32 = 16;

// -----------------------------------------------------------------------------
// Pool configuration and handles

/// Configuration for a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolDesc {
    /// Workers created beyond this bound are temporary and reclaimable.
    /// Also the initial quota.
    pub absolute_maximum: u32,
    /// Whether reclamation may move queued work between workers.
    pub enable_work_stealing: bool,
}

impl Default for ThreadPoolDesc {
    fn default() -> Self {
        let hardware = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        ThreadPoolDesc {
            absolute_maximum: hardware.min(DEFAULT_MAX_WORKERS),
            enable_work_stealing: true,
        }
    }
}

/// Handle to one unit of work queued directly on the pool.
pub struct PooledWork {
    work_id: u32,
    handle: Arc<WaitHandle>,
}

impl PooledWork {
    /// The pool-unique identifier of this work item.
    pub fn work_id(&self) -> u32 {
        self.work_id
    }

    /// The wait handle set when the work item finishes executing.
    pub fn wait_handle(&self) -> &Arc<WaitHandle> {
        &self.handle
    }

    /// Blocks the calling thread until the work item has executed.
    ///
    /// Raw wait; it does not lend worker capacity to the pool. Capacity
    /// lending is the task scheduler's concern; see
    /// [`TaskScheduler::wait_till_complete`].
    ///
    /// [`TaskScheduler::wait_till_complete`]: crate::scheduler::TaskScheduler::wait_till_complete
    pub fn wait_till_complete(&self) {
        self.handle.wait();
    }
}

/// Seam through which the pool reports task completion back to the task
/// scheduler, so satisfied dependencies are promoted promptly instead of
/// waiting for an unrelated scheduler wake.
pub trait CompletionListener: Send + Sync {
    fn task_completed(&self);
}

// -----------------------------------------------------------------------------
// Thread pool

struct PoolInner {
    permanent: Vec<Arc<PooledThread>>,
    temporary: Vec<Arc<PooledThread>>,
    /// Elastic upper bound on the worker count. Starts at the absolute
    /// maximum; capacity lending moves it up and down at runtime.
    quota: u32,
}

/// Owns the permanent and temporary worker sets and routes new work to the
/// least-busy worker.
pub struct ThreadPool {
    lifecycle: Lifecycle,
    desc: ThreadPoolDesc,
    inner: Mutex<PoolInner>,
    next_thread_id: CachePadded<AtomicU32>,
    next_work_id: CachePadded<AtomicU32>,
    /// Counts least-busy lookups between temporary-worker reclamation scans.
    worker_age: CachePadded<AtomicU32>,
    listener: Mutex<Option<Weak<dyn CompletionListener>>>,
}

impl ThreadPool {
    /// Constructs and initializes the pool. Workers are created lazily as
    /// work arrives.
    pub fn ignite(desc: ThreadPoolDesc) -> Arc<ThreadPool> {
        let lifecycle = Lifecycle::new("ThreadPool");
        lifecycle.mark_ignited();
        info!(
            "thread pool ignited: absolute maximum {}, work stealing {}",
            desc.absolute_maximum, desc.enable_work_stealing
        );

        Arc::new(ThreadPool {
            lifecycle,
            inner: Mutex::new(PoolInner {
                permanent: Vec::new(),
                temporary: Vec::new(),
                quota: desc.absolute_maximum,
            }),
            desc,
            next_thread_id: CachePadded::new(AtomicU32::new(0)),
            next_work_id: CachePadded::new(AtomicU32::new(0)),
            worker_age: CachePadded::new(AtomicU32::new(0)),
            listener: Mutex::new(None),
        })
    }

    /// Finds the least-busy worker (or creates one) and queues the given
    /// work on it at [`TaskPriority::DefaultPool`].
    pub fn queue_work<F>(self: &Arc<Self>, work: F) -> PooledWork
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.assert_ignited();

        let work_id = self.next_work_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = Task::new(
            TaskDesc::new(format!("PooledTask::{work_id}"), work)
                .with_priority(TaskPriority::DefaultPool),
        );

        let worker = self.get_or_create_least_busy_worker();
        let handle = worker.queue_task(task);

        PooledWork { work_id, handle }
    }

    /// Accepts a dependency-satisfied task from the scheduler's dispatch
    /// loop and queues it on the least-busy worker.
    pub(crate) fn add_scheduled_work(self: &Arc<Self>, task: Arc<Task>) {
        self.lifecycle.assert_ignited();
        let worker = self.get_or_create_least_busy_worker();
        worker.queue_task(task);
    }

    /// Raises the worker quota by one, allowing the next least-busy lookup
    /// to spin up an additional worker.
    pub fn add_worker(&self) {
        let mut inner = self.inner.lock();
        inner.quota += 1;
    }

    /// Lowers the worker quota by one. If the live worker count now exceeds
    /// the quota, a temporary worker is reclaimed: its queued work is stolen
    /// by the least-busy worker and the emptied temp is destroyed.
    pub fn remove_worker(self: &Arc<Self>) {
        let over_quota = {
            let mut inner = self.inner.lock();
            inner.quota = inner.quota.saturating_sub(1);
            Self::worker_count_locked(&inner) > inner.quota as usize
        };

        if over_quota {
            self.remove_one_worker();
        }
    }

    /// Number of live workers, permanent plus temporary.
    pub fn worker_count(&self) -> usize {
        Self::worker_count_locked(&self.inner.lock())
    }

    /// The current elastic worker quota.
    pub fn quota(&self) -> u32 {
        self.inner.lock().quota
    }

    /// Installs the completion listener notified after every executed task.
    pub fn set_completion_listener(&self, listener: Weak<dyn CompletionListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Signals the thread pool to shut down and joins all workers. Workers
    /// finish their in-flight task but abandon queued work.
    pub fn shutdown(&self) {
        self.lifecycle.mark_shut_down();

        let workers: Vec<Arc<PooledThread>> = {
            let mut inner = self.inner.lock();
            let mut workers: Vec<Arc<PooledThread>> = inner.permanent.drain(..).collect();
            workers.extend(inner.temporary.drain(..));
            workers
        };

        for worker in &workers {
            worker.kill();
        }
        info!("thread pool shut down, {} workers joined", workers.len());
    }

    pub(crate) fn notify_task_completed(&self) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.task_completed();
        }
    }

    fn worker_count_locked(inner: &PoolInner) -> usize {
        inner.permanent.len() + inner.temporary.len()
    }

    /// Returns the least-busy worker, creating a new one first whenever the
    /// worker count is below quota (or no workers exist at all).
    fn get_or_create_least_busy_worker(self: &Arc<Self>) -> Arc<PooledThread> {
        self.maybe_reclaim_temp_workers();

        let mut inner = self.inner.lock();
        let count = Self::worker_count_locked(&inner);

        if count >= inner.quota as usize && count > 0 {
            if let Some(worker) = Self::least_busy(&inner) {
                return worker;
            }
        }

        self.create_worker(&mut inner)
    }

    fn create_worker(self: &Arc<Self>, inner: &mut PoolInner) -> Arc<PooledThread> {
        let count = Self::worker_count_locked(inner);
        let temp_worker = count >= self.desc.absolute_maximum as usize;

        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed) + 1;
        let worker = PooledThread::ignite(id, Arc::downgrade(self), temp_worker);
        debug!(
            "created {} worker {}",
            if temp_worker { "temporary" } else { "permanent" },
            id
        );

        if temp_worker {
            inner.temporary.push(Arc::clone(&worker));
        } else {
            inner.permanent.push(Arc::clone(&worker));
        }
        worker
    }

    /// Least-busy worker by pending-queue length; ties prefer a permanent
    /// worker over a temporary one.
    fn least_busy(inner: &PoolInner) -> Option<Arc<PooledThread>> {
        let permanent = inner.permanent.iter().min_by_key(|w| w.work_size());
        let temporary = inner.temporary.iter().min_by_key(|w| w.work_size());

        match (permanent, temporary) {
            (Some(p), Some(t)) if t.work_size() < p.work_size() => Some(Arc::clone(t)),
            (Some(p), _) => Some(Arc::clone(p)),
            (None, Some(t)) => Some(Arc::clone(t)),
            (None, None) => None,
        }
    }

    /// Queues the reclamation task: the least-busy worker steals everything
    /// queued on the busiest temporary worker, then destroys the emptied
    /// temp. Runs at very high priority so it precedes ordinary pending
    /// work.
    fn remove_one_worker(self: &Arc<Self>) {
        let least_busy = {
            let inner = self.inner.lock();
            if !self.desc.enable_work_stealing || inner.temporary.is_empty() {
                return;
            }
            match Self::least_busy(&inner) {
                Some(worker) => worker,
                None => return,
            }
        };

        let pool = Arc::clone(self);
        let task = Task::new(
            TaskDesc::new("ReclaimTempWorker", move || {
                if let Some(victim_id) = pool.steal_from_busiest_temp() {
                    pool.remove_temp_worker(victim_id);
                }
            })
            .with_priority(TaskPriority::VeryHigh),
        );

        least_busy.queue_task(task);
    }

    /// Moves everything queued on the busiest temporary worker onto the
    /// least-busy worker. Returns the emptied victim's id.
    ///
    /// Runs inside a worker's execution stream, so the executing worker is
    /// never a victim candidate: destroying it would have this thread wait
    /// on (and join) itself. A skipped temp is picked up by a later
    /// reclamation scan once it goes idle.
    fn steal_from_busiest_temp(&self) -> Option<u32> {
        let (dest, victim) = {
            let inner = self.inner.lock();
            let victim = inner
                .temporary
                .iter()
                .filter(|w| !w.is_current_thread())
                .max_by_key(|w| w.work_size())
                .map(Arc::clone)?;
            let dest = Self::least_busy(&inner)?;
            (dest, victim)
        };

        if dest.id() == victim.id() {
            return None;
        }

        dest.steal_from(&victim);
        Some(victim.id())
    }

    fn remove_temp_worker(&self, worker_id: u32) {
        let worker = {
            let mut inner = self.inner.lock();
            inner
                .temporary
                .iter()
                .position(|w| w.id() == worker_id)
                .map(|index| inner.temporary.remove(index))
        };

        if let Some(worker) = worker {
            debug!("reclaiming temporary worker {worker_id}");
            worker.destroy();
        }
    }

    /// Every [`TEMP_WORKER_CHECK_PERIOD`] lookups, gracefully destroys any
    /// temporary worker with an empty queue and nothing executing.
    fn maybe_reclaim_temp_workers(&self) {
        let age = self.worker_age.fetch_add(1, Ordering::Relaxed) + 1;
        if age <= TEMP_WORKER_CHECK_PERIOD {
            return;
        }
        self.worker_age.store(0, Ordering::Relaxed);

        let reclaimed: Vec<Arc<PooledThread>> = {
            let mut inner = self.inner.lock();
            let mut reclaimed = Vec::new();
            let mut index = 0;
            while index < inner.temporary.len() {
                if !inner.temporary[index].has_work() {
                    reclaimed.push(inner.temporary.remove(index));
                } else {
                    index += 1;
                }
            }
            reclaimed
        };

        for worker in reclaimed {
            debug!("reclaiming idle temporary worker {}", worker.id());
            worker.destroy();
        }
    }
}

// -----------------------------------------------------------------------------
// Pooled threads

struct WorkerInner {
    queue: VecDeque<Arc<Task>>,
    idle: bool,
    started: bool,
    destroyed: bool,
}

/// One OS thread with a private, priority-sorted work queue.
///
/// The queue is re-sorted after every insert, so priority rank (not just
/// arrival order) decides execution order within the worker; the sort is
/// stable, so FIFO breaks ties. The entire queue can be stolen by another
/// worker; see the module docs for the lock order that makes this safe.
pub struct PooledThread {
    id: u32,
    temp_worker: bool,
    pool: Weak<ThreadPool>,
    inner: Mutex<WorkerInner>,
    /// Signalled when work arrives or the worker is killed.
    ready: Condvar,
    /// Signalled when the worker drains its queue and goes idle.
    finished: Condvar,
    /// Signalled once the worker thread enters its loop.
    started_signal: Condvar,
    /// True while a task body is executing. Queued work alone does not
    /// count; see [`PooledThread::has_work`].
    executing: AtomicBool,
    wait_handles: Mutex<HashMap<u32, Arc<WaitHandle>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PooledThread {
    /// Spawns the worker thread and blocks until it has entered its loop.
    pub(crate) fn ignite(id: u32, pool: Weak<ThreadPool>, temp_worker: bool) -> Arc<PooledThread> {
        let worker = Arc::new(PooledThread {
            id,
            temp_worker,
            pool,
            inner: Mutex::new(WorkerInner {
                queue: VecDeque::new(),
                idle: true,
                started: false,
                destroyed: false,
            }),
            ready: Condvar::new(),
            finished: Condvar::new(),
            started_signal: Condvar::new(),
            executing: AtomicBool::new(false),
            wait_handles: Mutex::new(HashMap::new()),
            thread: Mutex::new(None),
        });

        let handle = {
            let worker = Arc::clone(&worker);
            thread::Builder::new()
                .name(format!("forge-worker-{id}"))
                .spawn(move || worker.run())
                .expect("failed to spawn pooled worker thread")
        };
        *worker.thread.lock() = Some(handle);

        worker.await_started();
        worker
    }

    /// Queues a task on this worker, attaching and registering its wait
    /// handle and marking it `Scheduled`.
    pub(crate) fn queue_task(&self, task: Arc<Task>) -> Arc<WaitHandle> {
        let handle = Arc::new(WaitHandle::new());

        {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                warn!(
                    "task {} queued on destroyed worker {}; it will never run",
                    task.id(),
                    self.id
                );
            }
            inner.idle = false;

            task.set_wait_handle(Arc::clone(&handle));
            self.wait_handles.lock().insert(task.id(), Arc::clone(&handle));
            task.set_status(TaskStatus::Scheduled);

            inner.queue.push_back(task);
            Self::sort_queue(&mut inner.queue);
        }

        self.ready.notify_all();
        handle
    }

    /// Pending-queue length. The task currently executing is not counted.
    pub fn work_size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Returns `true` if the worker has queued work or is executing.
    pub fn has_work(&self) -> bool {
        self.executing.load(Ordering::Acquire) || self.work_size() > 0
    }

    /// Returns `true` if the worker is parked with an empty queue.
    pub fn is_idle(&self) -> bool {
        self.inner.lock().idle
    }

    pub fn is_temporary(&self) -> bool {
        self.temp_worker
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns `true` if the calling thread is this worker's own thread.
    pub(crate) fn is_current_thread(&self) -> bool {
        let thread = self.thread.lock();
        thread
            .as_ref()
            .map_or(false, |handle| handle.thread().id() == thread::current().id())
    }

    /// Moves every queued item (and its wait-handle registration) from
    /// `victim` onto this worker. Locks are taken in ascending worker-id
    /// order; only queued, not-yet-started items move.
    pub(crate) fn steal_from(&self, victim: &Arc<PooledThread>) {
        if self.id == victim.id {
            return;
        }

        {
            let (mut dest_inner, mut victim_inner);
            let (mut dest_handles, mut victim_handles);
            if self.id < victim.id {
                dest_inner = self.inner.lock();
                victim_inner = victim.inner.lock();
                dest_handles = self.wait_handles.lock();
                victim_handles = victim.wait_handles.lock();
            } else {
                victim_inner = victim.inner.lock();
                dest_inner = self.inner.lock();
                victim_handles = victim.wait_handles.lock();
                dest_handles = self.wait_handles.lock();
            }

            let stolen: Vec<Arc<Task>> = victim_inner.queue.drain(..).collect();
            for task in &stolen {
                if let Some(handle) = victim_handles.remove(&task.id()) {
                    dest_handles.insert(task.id(), handle);
                }
            }

            if !stolen.is_empty() {
                debug!(
                    "worker {} stole {} queued tasks from worker {}",
                    self.id,
                    stolen.len(),
                    victim.id
                );
                dest_inner.queue.extend(stolen);
                Self::sort_queue(&mut dest_inner.queue);
                dest_inner.idle = false;
            }
        }

        self.ready.notify_all();
    }

    /// Graceful death: waits until the queue is drained, then kills the
    /// worker.
    pub(crate) fn destroy(&self) {
        self.wait_till_complete();
        self.kill();
    }

    /// Blocks until the worker drains its queue and goes idle.
    pub(crate) fn wait_till_complete(&self) {
        let mut inner = self.inner.lock();
        while !inner.idle && !inner.destroyed {
            self.finished.wait(&mut inner);
        }
    }

    /// Kills the worker without waiting for queued work and joins its
    /// thread. The in-flight task, if any, still finishes.
    pub(crate) fn kill(&self) {
        {
            let mut inner = self.inner.lock();
            inner.destroyed = true;
        }
        self.ready.notify_all();
        self.finished.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("pooled worker {} was terminated by a panic", self.id);
            }
        }
    }

    fn await_started(&self) {
        let mut inner = self.inner.lock();
        while !inner.started {
            self.started_signal.wait(&mut inner);
        }
    }

    fn sort_queue(queue: &mut VecDeque<Arc<Task>>) {
        // Stable sort: priority rank first, FIFO among equal priorities.
        queue.make_contiguous().sort_by_key(|task| task.sort_rank());
    }

    /// The worker's main loop: pop the best-ranked task, execute it, signal
    /// its wait handle, go idle when the queue empties.
    fn run(&self) {
        {
            let mut inner = self.inner.lock();
            inner.started = true;
        }
        self.started_signal.notify_all();

        loop {
            let task = {
                let mut inner = self.inner.lock();
                loop {
                    if inner.destroyed {
                        return;
                    }
                    if let Some(task) = inner.queue.pop_front() {
                        break task;
                    }
                    inner.idle = true;
                    self.finished.notify_all();
                    self.ready.wait(&mut inner);
                    inner.idle = false;
                }
            };

            if task.is_cancelled() {
                // Cancelled between scheduling and pop: never runs, and its
                // handle is abandoned rather than completed.
                self.wait_handles.lock().remove(&task.id());
                continue;
            }

            self.executing.store(true, Ordering::Release);
            Self::execute_task(&task);
            self.signal_and_remove_wait_handle(task.id());
            self.executing.store(false, Ordering::Release);

            if let Some(pool) = self.pool.upgrade() {
                pool.notify_task_completed();
            }
        }
    }

    fn execute_task(task: &Arc<Task>) {
        task.set_status(TaskStatus::InProgress);
        task.mark_started();

        match task.take_work() {
            Some(work) => work(),
            None => warn!("task {} ({}) had no work body", task.id(), task.name()),
        }

        task.set_status(TaskStatus::Completed);
    }

    fn signal_and_remove_wait_handle(&self, task_id: u32) {
        match self.wait_handles.lock().remove(&task_id) {
            Some(handle) => handle.set(),
            None => warn!("no wait handle registered for task {task_id}"),
        }
    }
}
