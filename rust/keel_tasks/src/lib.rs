//! Cooperative, priority-aware task scheduling on a slot-per-worker thread
//! pool.
//!
//! A user submits work through a [`TaskScheduler`] combinator
//! ([`spawn`](TaskScheduler::spawn), [`spawn_chain`](TaskScheduler::spawn_chain),
//! [`spawn_delayed`](TaskScheduler::spawn_delayed),
//! [`await_all`](TaskScheduler::await_all),
//! [`await_any`](TaskScheduler::await_any)) and receives a
//! [`Future`](keel::future::Future). On every [`tick`](TaskScheduler::tick)
//! the scheduler promotes ready tasks into a fairness timeline, selects a
//! starved+prioritized subset into the worker slots, and the workers drain
//! their slots. Task closures observe cancel/suspend/preempt requests
//! through the same shared state the future exposes to the user; all
//! interruption is cooperative.
//!
//! ```no_run
//! use keel::alloc::OS_ALLOCATOR;
//! use keel_tasks::{TaskScheduler, NORMAL_PRIORITY};
//! use std::time::{Duration, Instant};
//!
//! let mut scheduler = TaskScheduler::new(OS_ALLOCATOR, Instant::now()).unwrap();
//! let answer = scheduler
//!     .spawn(|| 6 * 7, NORMAL_PRIORITY, Default::default())
//!     .unwrap();
//!
//! while !answer.is_done() {
//!     scheduler.tick(Duration::from_millis(1));
//! }
//! assert_eq!(answer.copy(), Ok(42));
//! ```

pub mod chain;
pub mod scheduler;
pub mod task;

mod thread_pool;
mod thread_slot;
mod timeline;

pub use chain::{Chain, ChainState, MAX_PHASES};
pub use scheduler::{FutureList, TaskScheduler};
pub use task::{
    TaskId, TaskPriority, TaskReady, TaskTraceInfo, CRITICAL_PRIORITY, INTERACTIVE_PRIORITY,
    NORMAL_PRIORITY,
};
