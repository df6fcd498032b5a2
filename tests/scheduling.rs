//! Cross-component scenarios for the task scheduler and thread pool:
//! dependency chains, groups, cancellation races and pool elasticity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use forge::prelude::*;
use parking_lot::Mutex;

fn harness(workers: u32) -> (Arc<ThreadPool>, Arc<TaskScheduler>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = ThreadPool::ignite(ThreadPoolDesc {
        absolute_maximum: workers,
        enable_work_stealing: true,
    });
    let scheduler = TaskScheduler::ignite(Arc::clone(&pool));
    (pool, scheduler)
}

fn teardown(pool: Arc<ThreadPool>, scheduler: Arc<TaskScheduler>) {
    scheduler.shutdown();
    pool.shutdown();
}

/// A three-link dependency chain executes strictly in order even when
/// submitted in reverse and plenty of workers are available.
#[test]
fn dependency_chains_execute_in_order() {
    let (pool, scheduler) = harness(4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let order = Arc::clone(&order);
        Task::new(TaskDesc::new("first", move || {
            thread::sleep(Duration::from_millis(10));
            order.lock().push(1);
        }))
    };
    let second = {
        let order = Arc::clone(&order);
        Task::new(
            TaskDesc::new("second", move || {
                thread::sleep(Duration::from_millis(10));
                order.lock().push(2);
            })
            .with_dependency(Arc::clone(&first)),
        )
    };
    let third = {
        let order = Arc::clone(&order);
        Task::new(
            TaskDesc::new("third", move || order.lock().push(3))
                .with_dependency(Arc::clone(&second)),
        )
    };

    scheduler.add_task(Arc::clone(&third));
    scheduler.add_task(Arc::clone(&second));
    scheduler.add_task(Arc::clone(&first));

    scheduler.wait_till_complete(&third);
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    teardown(pool, scheduler);
}

/// Every member of a group waits on the group's shared dependency; the
/// group completes as a unit.
#[test]
fn groups_wait_on_their_shared_dependency() {
    let (pool, scheduler) = harness(4);
    let upstream_done = Arc::new(AtomicUsize::new(0));
    let members_after_upstream = Arc::new(AtomicUsize::new(0));

    let upstream = {
        let upstream_done = Arc::clone(&upstream_done);
        Task::new(TaskDesc::new("upstream", move || {
            thread::sleep(Duration::from_millis(20));
            upstream_done.store(1, Ordering::SeqCst);
        }))
    };

    let group = TaskGroup::new("downstream", TaskPriority::Normal, Some(Arc::clone(&upstream)));
    for i in 0..3 {
        let upstream_done = Arc::clone(&upstream_done);
        let members_after_upstream = Arc::clone(&members_after_upstream);
        group.add_task(TaskDesc::new(format!("member-{i}"), move || {
            if upstream_done.load(Ordering::SeqCst) == 1 {
                members_after_upstream.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    scheduler.add_task_group(&group);
    scheduler.add_task(upstream);
    scheduler.wait_till_group_complete(&group);

    assert!(group.is_complete());
    assert_eq!(members_after_upstream.load(Ordering::SeqCst), 3);
    teardown(pool, scheduler);
}

/// Tasks inside one group may depend on each other; the dependent member
/// starts only after its dependency completed, and the group still
/// completes as a whole.
#[test]
fn intra_group_dependencies_are_honored() {
    let (pool, scheduler) = harness(4);
    let a_completed = Arc::new(Mutex::new(None::<Instant>));
    let b_started = Arc::new(Mutex::new(None::<Instant>));

    let group = TaskGroup::new("chained", TaskPriority::Normal, None);
    let a = {
        let a_completed = Arc::clone(&a_completed);
        group.add_task(TaskDesc::new("a", move || {
            thread::sleep(Duration::from_millis(10));
            *a_completed.lock() = Some(Instant::now());
        }))
    };
    let b = {
        let b_started = Arc::clone(&b_started);
        group.add_task(
            TaskDesc::new("b", move || {
                *b_started.lock() = Some(Instant::now());
            })
            .with_dependency(Arc::clone(&a)),
        )
    };

    scheduler.add_task_group(&group);
    scheduler.wait_till_group_complete(&group);

    assert!(a.is_complete());
    assert!(b.is_complete());
    let completed = a_completed.lock().expect("a never recorded completion");
    let started = b_started.lock().expect("b never recorded its start");
    assert!(completed <= started);
    teardown(pool, scheduler);
}

/// Cancelling a task that has already started has no effect; the body runs
/// to completion.
#[test]
fn cancelling_a_started_task_does_nothing() {
    let (pool, scheduler) = harness(1);
    let gate = Arc::new(WaitHandle::new());

    let task = {
        let gate = Arc::clone(&gate);
        Task::new(TaskDesc::new("running", move || gate.wait()))
    };
    scheduler.add_task(Arc::clone(&task));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !task.has_started() {
        assert!(Instant::now() < deadline, "task never started");
        thread::sleep(Duration::from_millis(1));
    }

    task.cancel();
    gate.set();
    scheduler.wait_till_complete(&task);

    assert!(task.is_complete());
    assert!(!task.is_cancelled());
    teardown(pool, scheduler);
}

/// Cancelling a task that is queued behind a busy worker prevents it from
/// ever starting; later work still flows.
#[test]
fn cancellation_wins_the_race_against_a_busy_worker() {
    let (pool, scheduler) = harness(1);
    let gate = Arc::new(WaitHandle::new());
    let touched = Arc::new(AtomicUsize::new(0));

    let blocker = {
        let gate = Arc::clone(&gate);
        Task::new(TaskDesc::new("blocker", move || gate.wait()))
    };
    let victim = {
        let touched = Arc::clone(&touched);
        Task::new(TaskDesc::new("victim", move || {
            touched.fetch_add(1, Ordering::SeqCst);
        }))
    };

    scheduler.add_task(Arc::clone(&blocker));
    scheduler.add_task(Arc::clone(&victim));

    // Give the dispatcher time to queue both behind the single worker, then
    // cancel while the blocker still holds the worker.
    let deadline = Instant::now() + Duration::from_secs(5);
    while blocker.status() != TaskStatus::InProgress {
        assert!(Instant::now() < deadline, "blocker never started");
        thread::sleep(Duration::from_millis(1));
    }
    victim.cancel();
    gate.set();

    scheduler.wait_till_complete(&blocker);

    // Push one more task through the worker so the cancelled one has been
    // popped and skipped for sure.
    let flush = Task::new(TaskDesc::new("flush", || {}));
    scheduler.add_task(Arc::clone(&flush));
    scheduler.wait_till_complete(&flush);

    assert!(victim.is_cancelled());
    assert!(!victim.has_started());
    assert_eq!(touched.load(Ordering::SeqCst), 0);
    teardown(pool, scheduler);
}

/// The pool never holds more workers than its quota once load subsides,
/// and a burst of tasks all complete.
#[test]
fn pool_elasticity_respects_the_quota() {
    let (pool, scheduler) = harness(2);
    let counter = Arc::new(AtomicUsize::new(0));

    let group = TaskGroup::new("burst", TaskPriority::Normal, None);
    for i in 0..16 {
        let counter = Arc::clone(&counter);
        group.add_task(TaskDesc::new(format!("burst-{i}"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    scheduler.add_task_group(&group);
    scheduler.wait_till_group_complete(&group);

    assert_eq!(counter.load(Ordering::SeqCst), 16);
    // Capacity lent during the wait has been returned.
    assert_eq!(pool.quota(), 2);
    assert!(pool.worker_count() <= 2 + 1, "stray temporary workers remain");
    teardown(pool, scheduler);
}

/// Direct pool work and scheduled tasks share workers without interfering.
#[test]
fn direct_work_and_scheduled_tasks_coexist() {
    let (pool, scheduler) = harness(2);
    let counter = Arc::new(AtomicUsize::new(0));

    let direct: Vec<_> = (0..4)
        .map(|_| {
            let counter = Arc::clone(&counter);
            pool.queue_work(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let counter = Arc::clone(&counter);
            let task = Task::new(TaskDesc::new(format!("mixed-{i}"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            scheduler.add_task(Arc::clone(&task));
            task
        })
        .collect();

    for work in &direct {
        work.wait_till_complete();
    }
    for task in &tasks {
        scheduler.wait_till_complete(task);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 8);
    teardown(pool, scheduler);
}

/// Waiting threads lend capacity: a single-worker pool still makes progress
/// while an outside thread blocks on a group.
#[test]
fn blocked_waiters_do_not_starve_the_pool() {
    let (pool, scheduler) = harness(1);

    let group = TaskGroup::new("slow", TaskPriority::Normal, None);
    for i in 0..4 {
        group.add_task(TaskDesc::new(format!("slow-{i}"), move || {
            thread::sleep(Duration::from_millis(5));
        }));
    }
    scheduler.add_task_group(&group);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let group_tasks = group.tasks();
            thread::spawn(move || {
                for task in &group_tasks {
                    scheduler.wait_till_complete(task);
                }
            })
        })
        .collect();

    scheduler.wait_till_group_complete(&group);
    for waiter in waiters {
        waiter.join().unwrap();
    }

    assert!(group.is_complete());
    assert_eq!(pool.quota(), 1);
    teardown(pool, scheduler);
}
