//! Threading core for real-time engines.
//!
//! Forge provides the three pieces an engine needs to keep simulation,
//! rendering and background work on separate threads without sprinkling ad
//! hoc synchronization everywhere:
//!
//! + A **core thread** pipeline ([`core_thread::CoreThread`]): producers on
//!   any thread buffer commands into private queues and submit them in
//!   batches to one designated consumer thread, which replays them in order.
//!   Built for the render-thread pattern where one thread owns a context
//!   that everyone else wants to talk to.
//! + An **elastic thread pool** ([`thread_pool::ThreadPool`]): permanent
//!   workers up to a quota, temporary workers beyond it, least-busy routing
//!   and queue-level work stealing when workers are reclaimed.
//! + A **task scheduler** ([`scheduler::TaskScheduler`]): dependency-aware
//!   dispatch of prioritized [`task::Task`]s and [`task::TaskGroup`]s onto
//!   the pool.
//!
//! Deferred outcomes are represented by [`async_result::AsyncResult`] over a
//! [`wait_handle::WaitHandle`]. Threads that block on one lend a unit of
//! worker capacity back to the pool for the duration of the wait, so waiting
//! never shrinks effective parallelism.
//!
//! All blocking in the crate is condition-variable based; nothing spins.
//!
//! ```no_run
//! use forge::prelude::*;
//! use std::{sync::Arc, thread};
//!
//! let pool = ThreadPool::ignite(ThreadPoolDesc::default());
//! let scheduler = TaskScheduler::ignite(Arc::clone(&pool));
//! let core = CoreThread::ignite(Arc::clone(&scheduler));
//!
//! // Producers on other threads queue commands and eventually stop the
//! // consumer.
//! let producer = {
//!     let core = Arc::clone(&core);
//!     thread::spawn(move || {
//!         let done = core.queue_command(
//!             || println!("on the core thread"),
//!             QueueFlags::INTERNAL_QUEUE | QueueFlags::BLOCK_UNTIL_COMPLETE,
//!         );
//!         assert!(done.has_completed());
//!         core.shutdown();
//!     })
//! };
//!
//! // The ignition thread becomes the consumer until shutdown.
//! core.run();
//! producer.join().unwrap();
//!
//! scheduler.shutdown();
//! pool.shutdown();
//! ```

pub mod async_result;
pub mod command_queue;
pub mod core_thread;
pub mod error;
pub mod scheduler;
pub mod task;
pub mod thread_pool;
pub mod wait_handle;

mod lifecycle;

pub use lifecycle::LifecycleState;

pub mod prelude {
    pub use crate::async_result::AsyncResult;
    pub use crate::core_thread::{CoreThread, QueueFlags};
    pub use crate::error::ForgeError;
    pub use crate::scheduler::TaskScheduler;
    pub use crate::task::{Task, TaskDesc, TaskGroup, TaskPriority, TaskStatus};
    pub use crate::thread_pool::{PooledWork, ThreadPool, ThreadPoolDesc};
    pub use crate::wait_handle::WaitHandle;
}
