//! Dependency-aware task scheduling on top of the thread pool.
//!
//! The [`TaskScheduler`] holds submitted tasks in a pending list and runs a
//! dedicated dispatch thread that promotes them to the pool once their
//! dependency (if any) has completed. Dispatch is level-triggered: any event
//! that may have unblocked a task (a new submission, a completed task, a
//! capacity change) sets a flag and wakes the dispatcher, which rescans the
//! whole pending list. Rescanning is simple and self-healing; a missed or
//! spurious wake costs one extra scan, never a lost task.
//!
//! The scheduler is also the crate's [`CapacityLender`]. A thread about to
//! block on deferred work takes a [`CapacityLease`], which bumps the pool's
//! worker quota for the duration of the wait so that a sleeping thread does
//! not reduce effective parallelism.

use std::sync::Arc;
use std::thread;

use log::{error, info};
use parking_lot::{Condvar, Mutex};

use crate::lifecycle::Lifecycle;
use crate::task::{Task, TaskGroup, TaskStatus};
use crate::thread_pool::{CompletionListener, ThreadPool};

// -----------------------------------------------------------------------------
// Capacity lending

/// Lends one unit of worker capacity to the pool while the holder is blocked.
pub trait CapacityLender: Send + Sync {
    /// Raises the pool's worker quota by one.
    fn add_worker(&self);
    /// Lowers the pool's worker quota by one.
    fn remove_worker(&self);
}

/// RAII guard for one lent unit of capacity. Acquiring it raises the quota;
/// dropping it lowers the quota again, on every exit path including panics.
pub(crate) struct CapacityLease<'a> {
    lender: &'a dyn CapacityLender,
}

impl<'a> CapacityLease<'a> {
    pub(crate) fn acquire(lender: &'a dyn CapacityLender) -> CapacityLease<'a> {
        lender.add_worker();
        CapacityLease { lender }
    }
}

impl Drop for CapacityLease<'_> {
    fn drop(&mut self) {
        self.lender.remove_worker();
    }
}

// -----------------------------------------------------------------------------
// Task scheduler

struct SchedulerState {
    /// Tasks accepted but not yet handed to the pool.
    pending: Vec<Arc<Task>>,
    /// Set whenever the pending list may have become dispatchable.
    check_tasks: bool,
    shutdown: bool,
}

/// Accepts tasks and task groups and dispatches them to the [`ThreadPool`]
/// once their dependencies are satisfied.
pub struct TaskScheduler {
    lifecycle: Lifecycle,
    pool: Arc<ThreadPool>,
    state: Mutex<SchedulerState>,
    task_ready: Condvar,
    dispatch_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Constructs the scheduler, registers it as the pool's completion
    /// listener and starts the dispatch thread.
    pub fn ignite(pool: Arc<ThreadPool>) -> Arc<TaskScheduler> {
        let lifecycle = Lifecycle::new("TaskScheduler");
        lifecycle.mark_ignited();

        let scheduler = Arc::new(TaskScheduler {
            lifecycle,
            pool,
            state: Mutex::new(SchedulerState {
                pending: Vec::new(),
                check_tasks: false,
                shutdown: false,
            }),
            task_ready: Condvar::new(),
            dispatch_thread: Mutex::new(None),
        });

        let listener = Arc::downgrade(&scheduler);
        scheduler.pool.set_completion_listener(listener);

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            thread::Builder::new()
                .name("forge-scheduler".into())
                .spawn(move || scheduler.dispatch_loop())
                .expect("failed to spawn task scheduler dispatch thread")
        };
        *scheduler.dispatch_thread.lock() = Some(handle);

        info!("task scheduler ignited");
        scheduler
    }

    /// Submits a task for dependency-aware dispatch. Returns the task's id.
    ///
    /// The task must be freshly created: submitting a task that was already
    /// queued, executed or cancelled is a fatal programming error.
    pub fn add_task(&self, task: Arc<Task>) -> u32 {
        self.lifecycle.assert_ignited();

        let status = task.status();
        if status != TaskStatus::Waiting {
            error!(
                "task {} ({}) submitted in state {:?}, expected Waiting",
                task.id(),
                task.name(),
                status
            );
            panic!("task submitted to the scheduler more than once");
        }

        let id = task.id();
        {
            let mut state = self.state.lock();
            state.pending.push(task);
            state.check_tasks = true;
        }
        self.task_ready.notify_one();
        id
    }

    /// Submits every member of a group. Returns the group's id.
    pub fn add_task_group(&self, group: &TaskGroup) -> u32 {
        self.lifecycle.assert_ignited();

        for task in group.tasks() {
            task.set_group(group.id());
            self.add_task(task);
        }
        group.id()
    }

    /// Blocks until the task completes, lending capacity to the pool for
    /// the duration of the wait.
    pub fn wait_till_complete(&self, task: &Task) {
        let _lease = CapacityLease::acquire(self);
        task.wait();
    }

    /// Blocks until every member of the group completes, lending capacity
    /// to the pool for the duration of the wait.
    pub fn wait_till_group_complete(&self, group: &TaskGroup) {
        let _lease = CapacityLease::acquire(self);
        group.wait_for_all();
    }

    /// The pool this scheduler dispatches to.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Stops the dispatch thread and joins it. Pending tasks that were never
    /// dispatched are abandoned in the `Waiting` state.
    pub fn shutdown(&self) {
        self.lifecycle.mark_shut_down();

        let abandoned = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.pending.len()
        };
        self.task_ready.notify_all();

        let handle = self.dispatch_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("task scheduler dispatch thread was terminated by a panic");
            }
        }

        info!("task scheduler shut down, {abandoned} pending tasks abandoned");
    }

    /// Dispatch loop body. Waits for a wake, then rescans the pending list:
    /// cancelled tasks are dropped, dependents of cancelled tasks are
    /// cancelled in turn, blocked tasks stay, everything else goes to the
    /// pool. Dispatch happens outside the state lock.
    fn dispatch_loop(&self) {
        loop {
            let ready = {
                let mut state = self.state.lock();
                while !state.check_tasks && !state.shutdown {
                    self.task_ready.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
                state.check_tasks = false;

                let mut ready = Vec::new();
                state.pending.retain(|task| {
                    if task.is_cancelled() {
                        return false;
                    }
                    match task.dependency() {
                        // A dependent of a cancelled task can never satisfy
                        // its precedence constraint; it is cancelled in turn
                        // rather than held forever.
                        Some(dep) if dep.is_cancelled() => {
                            task.cancel();
                            false
                        }
                        Some(dep) if !dep.is_complete() => true,
                        _ => {
                            ready.push(Arc::clone(task));
                            false
                        }
                    }
                });
                ready
            };

            for task in ready {
                self.pool.add_scheduled_work(task);
            }
        }
    }
}

impl CapacityLender for TaskScheduler {
    fn add_worker(&self) {
        self.pool.add_worker();
        // Extra capacity may let a pending task through.
        let mut state = self.state.lock();
        state.check_tasks = true;
        self.task_ready.notify_one();
    }

    fn remove_worker(&self) {
        self.pool.remove_worker();
    }
}

impl CompletionListener for TaskScheduler {
    fn task_completed(&self) {
        let mut state = self.state.lock();
        state.check_tasks = true;
        self.task_ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskDesc, TaskPriority};
    use crate::thread_pool::ThreadPoolDesc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler_with_workers(workers: u32) -> Arc<TaskScheduler> {
        TaskScheduler::ignite(ThreadPool::ignite(ThreadPoolDesc {
            absolute_maximum: workers,
            enable_work_stealing: true,
        }))
    }

    #[test]
    fn tasks_run_and_complete() {
        let scheduler = scheduler_with_workers(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let task = {
            let counter = Arc::clone(&counter);
            Task::new(TaskDesc::new("count", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        };
        scheduler.add_task(Arc::clone(&task));
        scheduler.wait_till_complete(&task);

        assert!(task.is_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    fn dependent_task_runs_after_its_dependency() {
        let scheduler = scheduler_with_workers(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            Task::new(TaskDesc::new("first", move || {
                thread::sleep(Duration::from_millis(20));
                order.lock().push("first");
            }))
        };
        let second = {
            let order = Arc::clone(&order);
            Task::new(
                TaskDesc::new("second", move || order.lock().push("second"))
                    .with_dependency(Arc::clone(&first)),
            )
        };

        // Submit the dependent first to force the scheduler to hold it.
        scheduler.add_task(Arc::clone(&second));
        scheduler.add_task(Arc::clone(&first));

        scheduler.wait_till_complete(&second);
        assert_eq!(*order.lock(), vec!["first", "second"]);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    fn cancelled_pending_task_is_never_dispatched() {
        let scheduler = scheduler_with_workers(2);

        // Dependency that never completes keeps the dependent pending.
        let never = Task::new(TaskDesc::new("never", || {}));
        let touched = Arc::new(AtomicUsize::new(0));
        let task = {
            let touched = Arc::clone(&touched);
            Task::new(
                TaskDesc::new("held", move || {
                    touched.fetch_add(1, Ordering::SeqCst);
                })
                .with_dependency(never),
            )
        };

        scheduler.add_task(Arc::clone(&task));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.status(), TaskStatus::Waiting);

        task.cancel();
        thread::sleep(Duration::from_millis(20));

        assert!(task.is_cancelled());
        assert_eq!(touched.load(Ordering::SeqCst), 0);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    fn cancelled_dependency_cancels_the_dependent() {
        let scheduler = scheduler_with_workers(2);

        let dep = Task::new(TaskDesc::new("dep", || {}));
        dep.cancel();

        let touched = Arc::new(AtomicUsize::new(0));
        let dependent = {
            let touched = Arc::clone(&touched);
            Task::new(
                TaskDesc::new("dependent", move || {
                    touched.fetch_add(1, Ordering::SeqCst);
                })
                .with_dependency(dep),
            )
        };
        scheduler.add_task(Arc::clone(&dependent));

        // The dispatcher must neither run the dependent nor hold it forever.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !dependent.is_cancelled() {
            assert!(
                std::time::Instant::now() < deadline,
                "dependent of a cancelled task was never cancelled"
            );
            thread::sleep(Duration::from_millis(1));
        }

        assert!(!dependent.is_complete());
        assert!(!dependent.has_started());
        assert_eq!(touched.load(Ordering::SeqCst), 0);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    fn task_groups_complete_as_a_unit() {
        let scheduler = scheduler_with_workers(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let group = TaskGroup::new("bundle", TaskPriority::High, None);
        for i in 0..4 {
            let counter = Arc::clone(&counter);
            group.add_task(TaskDesc::new(format!("member-{i}"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let group_id = scheduler.add_task_group(&group);
        assert_eq!(group_id, group.id());
        scheduler.wait_till_group_complete(&group);

        assert!(group.is_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    fn waiting_lends_and_returns_capacity() {
        let scheduler = scheduler_with_workers(1);
        let quota_before = scheduler.pool().quota();

        let task = Task::new(TaskDesc::new("t", || {
            thread::sleep(Duration::from_millis(10));
        }));
        scheduler.add_task(Arc::clone(&task));
        scheduler.wait_till_complete(&task);

        assert_eq!(scheduler.pool().quota(), quota_before);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    fn scheduler_waits_lend_capacity_but_raw_waits_do_not() {
        let scheduler = scheduler_with_workers(1);
        let gate = Arc::new(crate::wait_handle::WaitHandle::new());

        let task = {
            let gate = Arc::clone(&gate);
            Task::new(TaskDesc::new("gated", move || gate.wait()))
        };
        scheduler.add_task(Arc::clone(&task));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !task.has_started() {
            assert!(std::time::Instant::now() < deadline, "task never started");
            thread::sleep(Duration::from_millis(1));
        }

        // A raw Task::wait leaves the quota untouched.
        let raw_waiter = {
            let task = Arc::clone(&task);
            thread::spawn(move || task.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(scheduler.pool().quota(), 1);

        // The scheduler's wrapper lends one unit for the wait's duration.
        let lending_waiter = {
            let scheduler = Arc::clone(&scheduler);
            let task = Arc::clone(&task);
            thread::spawn(move || scheduler.wait_till_complete(&task))
        };
        while scheduler.pool().quota() != 2 {
            assert!(
                std::time::Instant::now() < deadline,
                "waiting never lent capacity"
            );
            thread::sleep(Duration::from_millis(1));
        }

        gate.set();
        raw_waiter.join().unwrap();
        lending_waiter.join().unwrap();

        assert_eq!(scheduler.pool().quota(), 1);
        scheduler.shutdown();
        scheduler.pool().shutdown();
    }

    #[test]
    #[should_panic(expected = "submitted to the scheduler more than once")]
    fn resubmitting_a_task_is_fatal() {
        let scheduler = scheduler_with_workers(1);
        let task = Task::new(TaskDesc::new("t", || {}));
        scheduler.add_task(Arc::clone(&task));
        scheduler.wait_till_complete(&task);
        scheduler.add_task(task);
    }
}
