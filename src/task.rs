//! Schedulable units of work and named bundles of them.
//!
//! A [`Task`] is a single body of work with a priority, an optional single
//! upstream dependency and an explicit status state machine:
//!
//! ```text
//! Waiting --dispatch--> Scheduled --popped--> InProgress --body returns--> Completed
//!    \________________________/
//!        cancel() -> Cancelled
//! ```
//!
//! Cancellation is best-effort and non-preemptive: once a worker has popped
//! a task it runs to completion regardless. A [`TaskGroup`] is a named
//! collection of tasks created together that share one priority and one
//! optional dependency; the group has no status of its own, completion is
//! derived from its members.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::wait_handle::WaitHandle;

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_GROUP_ID: AtomicU32 = AtomicU32::new(1);

// -----------------------------------------------------------------------------
// Priority and status

/// Task priority. Higher-priority tasks are executed sooner within one
/// worker's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPriority {
    VeryLow,
    Low,
    /// Default priority for work queued on the thread pool directly.
    DefaultPool,
    Normal,
    High,
    VeryHigh,
}

impl TaskPriority {
    /// Sort rank within a worker queue; lower ranks execute first.
    pub(crate) fn rank(self) -> u8 {
        match self {
            TaskPriority::VeryHigh => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::DefaultPool => 3,
            TaskPriority::Low => 4,
            TaskPriority::VeryLow => 5,
        }
    }
}

/// The state a task is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Held by the task scheduler; not yet dispatch-eligible or not yet
    /// dispatched. No wait handle is attached at this stage.
    Waiting,
    /// Queued on a pooled worker. The wait handle is attached from this
    /// stage on.
    Scheduled,
    /// Currently executing.
    InProgress,
    /// The body has returned.
    Completed,
    /// Cancelled before a worker popped it; will never execute.
    Cancelled,
}

// -----------------------------------------------------------------------------
// Task

/// Description used to create a task.
pub struct TaskDesc {
    pub name: String,
    pub priority: TaskPriority,
    pub dependency: Option<Arc<Task>>,
    pub work: Box<dyn FnOnce() + Send>,
}

impl TaskDesc {
    /// Creates a description with `Normal` priority and no dependency.
    pub fn new<F>(name: impl Into<String>, work: F) -> TaskDesc
    where
        F: FnOnce() + Send + 'static,
    {
        TaskDesc {
            name: name.into(),
            priority: TaskPriority::Normal,
            dependency: None,
            work: Box::new(work),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> TaskDesc {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dependency: Arc<Task>) -> TaskDesc {
        self.dependency = Some(dependency);
        self
    }
}

struct TaskInner {
    status: TaskStatus,
    priority: TaskPriority,
    group_id: Option<u32>,
    work: Option<Box<dyn FnOnce() + Send>>,
    wait_handle: Option<Arc<WaitHandle>>,
}

/// A single executable work item.
///
/// Tasks are shared between the scheduler, the executing worker's queue and
/// any caller holding the handle, so they are always behind an `Arc` and
/// live until the last holder drops them.
pub struct Task {
    id: u32,
    name: String,
    dependency: Option<Arc<Task>>,
    inner: Mutex<TaskInner>,
    /// Set the moment a worker begins executing the body. Lets `wait` calls
    /// that arrive before scheduling block until a wait handle exists.
    started: WaitHandle,
}

impl Task {
    /// Creates a new task in the `Waiting` state.
    pub fn new(desc: TaskDesc) -> Arc<Task> {
        Arc::new(Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: desc.name,
            dependency: desc.dependency,
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Waiting,
                priority: desc.priority,
                group_id: None,
                work: Some(desc.work),
                wait_handle: None,
            }),
            started: WaitHandle::new(),
        })
    }

    /// The task's process-unique identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn priority(&self) -> TaskPriority {
        self.inner.lock().priority
    }

    /// The upstream task that must complete before this one is dispatched.
    pub fn dependency(&self) -> Option<&Arc<Task>> {
        self.dependency.as_ref()
    }

    /// Returns `true` if the task has completed.
    pub fn is_complete(&self) -> bool {
        self.status() == TaskStatus::Completed
    }

    /// Returns `true` if the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Returns `true` if the task is currently executing.
    pub fn has_started(&self) -> bool {
        self.status() == TaskStatus::InProgress
    }

    /// The wait handle attached when the task was scheduled, if any.
    pub fn wait_handle(&self) -> Option<Arc<WaitHandle>> {
        self.inner.lock().wait_handle.clone()
    }

    /// Requests cancellation. Only effective while the task is `Waiting` or
    /// `Scheduled`; a task a worker has already popped runs to completion.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.status, TaskStatus::Waiting | TaskStatus::Scheduled) {
            inner.status = TaskStatus::Cancelled;
        }
    }

    /// Blocks the calling thread until the task completes.
    ///
    /// This is the raw wait; it does not lend worker capacity to the pool.
    /// Callers that may block for a while should prefer
    /// [`TaskScheduler::wait_till_complete`], which lends one unit of
    /// capacity for the duration.
    ///
    /// A cancelled task never completes, so waiting on one without an
    /// external timeout blocks indefinitely.
    ///
    /// [`TaskScheduler::wait_till_complete`]: crate::scheduler::TaskScheduler::wait_till_complete
    pub fn wait(&self) {
        let handle = loop {
            if let Some(handle) = self.wait_handle() {
                break handle;
            }
            warn!("task {} ({}) not yet scheduled; waiting for start", self.id, self.name);
            self.started.wait();
        };

        handle.wait();
    }

    pub(crate) fn group_id(&self) -> Option<u32> {
        self.inner.lock().group_id
    }

    pub(crate) fn set_group(&self, group_id: u32) {
        self.inner.lock().group_id = Some(group_id);
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.inner.lock().status = status;
    }

    pub(crate) fn set_priority(&self, priority: TaskPriority) {
        self.inner.lock().priority = priority;
    }

    pub(crate) fn set_wait_handle(&self, handle: Arc<WaitHandle>) {
        self.inner.lock().wait_handle = Some(handle);
    }

    pub(crate) fn take_work(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.inner.lock().work.take()
    }

    pub(crate) fn mark_started(&self) {
        self.started.set();
    }

    /// Sort key for worker queues: priority rank first, FIFO among equals
    /// (the queue sort is stable).
    pub(crate) fn sort_rank(&self) -> u8 {
        self.inner.lock().priority.rank()
    }
}

// -----------------------------------------------------------------------------
// Task group

/// A named bundle of tasks created together and scheduled as one unit.
///
/// Every member takes the group's priority and dependency at creation. The
/// group itself has no status; [`TaskGroup::is_complete`] derives it from
/// the members.
pub struct TaskGroup {
    id: u32,
    name: String,
    priority: TaskPriority,
    dependency: Option<Arc<Task>>,
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl TaskGroup {
    /// Creates an empty group. Members added later inherit `priority` and
    /// `dependency`.
    pub fn new(
        name: impl Into<String>,
        priority: TaskPriority,
        dependency: Option<Arc<Task>>,
    ) -> TaskGroup {
        TaskGroup {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            priority,
            dependency,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Adds a new member task. The member takes the group's priority; the
    /// group's dependency applies to members that do not declare their own,
    /// so tasks inside one group may still depend on each other.
    pub fn add_task(&self, mut desc: TaskDesc) -> Arc<Task> {
        desc.priority = self.priority;
        if desc.dependency.is_none() {
            desc.dependency = self.dependency.clone();
        }

        let task = Task::new(desc);
        self.tasks.lock().push(Arc::clone(&task));
        task
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once every member task has completed.
    pub fn is_complete(&self) -> bool {
        self.tasks.lock().iter().all(|task| task.is_complete())
    }

    /// Blocks the calling thread until every member task has completed.
    ///
    /// Raw wait; does not lend worker capacity. Prefer
    /// [`TaskScheduler::wait_till_group_complete`] for waits that may block.
    ///
    /// [`TaskScheduler::wait_till_group_complete`]: crate::scheduler::TaskScheduler::wait_till_group_complete
    pub fn wait_for_all(&self) {
        for task in self.tasks() {
            task.wait();
        }
    }

    /// Snapshot of the group's member tasks.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().clone()
    }
}
