//! The task scheduler facade and its submission combinators.
//!
//! A combinator builds a task record (entry point, readiness predicate,
//! erased promise, id, priority, submission time) onto the pending queue
//! and hands back a [`Future`]. Each [`TaskScheduler::tick`] promotes ready
//! tasks into the timeline, runs a selection pass against the pool's slots
//! and advances the pool's shutdown machine. `tick` must be called from one
//! thread; the workers are the only executors of task closures.

use crate::chain::{self, Chain, ChainState};
use crate::task::{
    make_task_fn, task_is_ready, Task, TaskId, TaskPriority, TaskReady, TaskTraceInfo,
};
use crate::thread_pool::ThreadPool;
use crate::timeline::ScheduleTimeline;
use keel::alloc::{AllocError, Allocator};
use keel::future::{
    make_promise, CancelRequest, Future, FutureAny, PreemptRequest, Promise, PromiseAny,
    RequestProxy, RequestType, ServiceToken, SuspendRequest,
};
use log::{debug, trace};
use std::time::{Duration, Instant};

/// Inputs awaited by [`TaskScheduler::await_all`] / [`await_any`]: a tuple
/// of futures, moved into the task closure once ready.
///
/// [`await_any`]: TaskScheduler::await_any
pub trait FutureList: Send + 'static {
    /// Type-erased views for readiness polling, one per future.
    fn views(&self) -> Vec<FutureAny>;
}

macro_rules! impl_future_list {
    ($($input:ident),+) => {
        impl<$($input: Send + 'static),+> FutureList for ($(Future<$input>,)+) {
            fn views(&self) -> Vec<FutureAny> {
                #[allow(non_snake_case)]
                let ($($input,)+) = self;
                vec![$(FutureAny::from($input.share())),+]
            }
        }
    };
}

impl_future_list!(A);
impl_future_list!(A, B);
impl_future_list!(A, B, C);
impl_future_list!(A, B, C, D);
impl_future_list!(A, B, C, D, E);
impl_future_list!(A, B, C, D, E, F);
impl_future_list!(A, B, C, D, E, F, G);
impl_future_list!(A, B, C, D, E, F, G, H);

/// Polls the request flags on task entry. Returns `false` (after the
/// matching notification) when a pending request means the task must not
/// run right now.
fn honour_entry_requests<T>(promise: &Promise<T>) -> bool {
    if promise.fetch_cancel_request() == CancelRequest::Canceled {
        promise.notify_canceled();
        return false;
    }

    if promise.fetch_preempt_request() == PreemptRequest::Preempted {
        promise.notify_preempted();
        return false;
    }

    if promise.fetch_suspend_request() == SuspendRequest::Suspended {
        promise.notify_suspended();
        return false;
    }

    promise.notify_executing();
    true
}

/// Cooperative, priority-aware task scheduler.
///
/// Dispatches ready tasks to the fairness timeline, which rotates them
/// through a slot-per-worker thread pool.
#[derive(Debug)]
pub struct TaskScheduler {
    allocator: Allocator,
    reference_timepoint: Instant,
    entries: Vec<Task>,
    cancelation_promise: Promise<()>,
    next_task_id: u64,
    thread_pool: ThreadPool,
    timeline: ScheduleTimeline,
}

impl TaskScheduler {
    /// Creates a scheduler with one worker per hardware thread.
    pub fn new(allocator: Allocator, reference_timepoint: Instant) -> Result<Self, AllocError> {
        Self::with_workers(allocator, reference_timepoint, None)
    }

    /// Creates a scheduler with an explicit worker count. `Some(0)` is
    /// legal: ready tasks are still promoted and reaped, but nothing
    /// executes.
    pub fn with_workers(
        allocator: Allocator,
        reference_timepoint: Instant,
        workers: Option<usize>,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            allocator,
            reference_timepoint,
            entries: Vec::new(),
            cancelation_promise: make_promise(allocator)?,
            next_task_id: 0,
            thread_pool: ThreadPool::new(allocator, workers)?,
            timeline: ScheduleTimeline::new(),
        })
    }

    /// The timepoint the scheduler was created against.
    pub fn reference_timepoint(&self) -> Instant {
        self.reference_timepoint
    }

    /// Number of tasks still waiting for their readiness predicate.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of ready tasks rotating through the timeline.
    pub fn active_count(&self) -> usize {
        self.timeline.len()
    }

    /// Requests a scheduler-wide cooperative shutdown: every outstanding
    /// task resolves to canceled and the pool winds down over the following
    /// ticks.
    pub fn request_cancel(&self) {
        self.cancelation_promise.request_cancel();
    }

    /// The pool's shutdown future; done once every worker has exited.
    pub fn shutdown_future(&self) -> FutureAny {
        self.thread_pool.future()
    }

    /// One scheduling step. Must always be called from the same thread.
    pub fn tick(&mut self, interval: Duration) {
        let present = Instant::now();

        // promote ready tasks into the timeline
        let mut index = 0;
        while index < self.entries.len() {
            let elapsed = present - self.entries[index].schedule_timepoint;
            if (self.entries[index].poll_ready)(elapsed) == TaskReady::No {
                index += 1;
                continue;
            }

            if self.timeline.reserve_one().is_err() {
                // no memory to promote with; the task stays pending and we
                // retry on a later tick
                index += 1;
                continue;
            }

            let task = self.entries.swap_remove(index);
            trace!(
                "task {} ({}) ready, promoting to timeline",
                task.id,
                task.trace.purpose.handle()
            );
            self.timeline
                .add_task(task.entry, task.promise, task.id, task.priority, present)
                .expect("capacity was reserved above");
        }

        self.timeline.tick(self.thread_pool.slots(), present);
        self.thread_pool.tick(interval);

        // a requested shutdown cancels everything still outstanding and
        // asks the pool to wind down
        if self.cancelation_promise.fetch_cancel_request() == CancelRequest::Canceled {
            debug!(
                "scheduler cancelation requested; canceling {} pending and {} active tasks",
                self.entries.len(),
                self.timeline.len()
            );

            for task in self.entries.drain(..) {
                task.promise.request_cancel();
                task.promise.notify_canceled();
            }

            self.timeline.cancel_all();
            self.thread_pool.future().request_cancel();
        }
    }

    fn allocate_task_id(&mut self) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    fn enqueue(
        &mut self,
        entry_fn: impl FnMut() + Send + 'static,
        poll_ready: Box<dyn FnMut(Duration) -> TaskReady + Send>,
        promise: PromiseAny,
        id: TaskId,
        priority: TaskPriority,
        trace: TaskTraceInfo,
    ) -> Result<(), AllocError> {
        self.entries.try_reserve(1).map_err(|_| AllocError::OutOfMemory)?;
        let entry = make_task_fn(self.allocator, entry_fn)?;

        self.entries.push(Task {
            entry,
            poll_ready,
            promise,
            id,
            priority,
            schedule_timepoint: Instant::now(),
            trace,
        });

        Ok(())
    }

    /// Schedules `f` for execution as soon as a slot is granted.
    ///
    /// The task honours cancel, preempt and suspend requests pending on
    /// entry: if one is set before the closure runs, it yields without
    /// executing.
    pub fn spawn<F, R>(
        &mut self,
        f: F,
        priority: TaskPriority,
        trace: TaskTraceInfo,
    ) -> Result<Future<R>, AllocError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.allocate_task_id();
        let promise = make_promise::<R>(self.allocator)?;
        let future = promise.future();
        let scheduler_promise = PromiseAny::from(promise.share());

        let mut f = Some(f);
        let entry = move || {
            if !honour_entry_requests(&promise) {
                return;
            }

            if let Some(f) = f.take() {
                promise.notify_completed(f());
            }
        };

        self.enqueue(entry, Box::new(task_is_ready), scheduler_promise, id, priority, trace)?;
        Ok(future)
    }

    /// Schedules a [`Chain`]. The chain yields between phases when asked
    /// to; the scheduler republishes the yield reason as the corresponding
    /// future state and resumes the chain on a later slot grant.
    pub fn spawn_chain<R>(
        &mut self,
        chain: Chain<R>,
        priority: TaskPriority,
        trace: TaskTraceInfo,
    ) -> Result<Future<R>, AllocError>
    where
        R: Send + 'static,
    {
        let id = self.allocate_task_id();
        let promise = make_promise::<R>(self.allocator)?;
        let future = promise.future();
        let scheduler_promise = PromiseAny::from(promise.share());
        let proxy = RequestProxy::from(&promise);

        let mut chain = chain;
        let mut stack = chain::empty_stack();
        let mut state = ChainState::default();
        let entry = move || {
            if (state.next_phase_index as usize) == chain.num_phases() {
                // already completed on a previous grant
                return;
            }

            if !honour_entry_requests(&promise) {
                return;
            }

            chain.resume(&mut stack, &mut state, &proxy);

            if (state.next_phase_index as usize) < chain.num_phases() {
                match state.service_token {
                    Some(ServiceToken(RequestType::Cancel)) => promise.notify_canceled(),
                    Some(ServiceToken(RequestType::Preempt)) => promise.notify_preempted(),
                    Some(ServiceToken(RequestType::Suspend)) => promise.notify_suspended(),
                    None => {}
                }
            } else {
                let stack = std::mem::replace(&mut stack, chain::empty_stack());
                promise.notify_completed(Chain::<R>::into_result(stack));
            }
        };

        self.enqueue(entry, Box::new(task_is_ready), scheduler_promise, id, priority, trace)?;
        Ok(future)
    }

    /// Schedules `f`, holding it in the pending queue until `delay` has
    /// elapsed since submission.
    pub fn spawn_delayed<F, R>(
        &mut self,
        f: F,
        priority: TaskPriority,
        trace: TaskTraceInfo,
        delay: Duration,
    ) -> Result<Future<R>, AllocError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.allocate_task_id();
        let promise = make_promise::<R>(self.allocator)?;
        let future = promise.future();
        let scheduler_promise = PromiseAny::from(promise.share());

        let poll_ready = Box::new(move |elapsed: Duration| {
            if elapsed >= delay {
                TaskReady::Yes
            } else {
                TaskReady::No
            }
        });

        let mut f = Some(f);
        let entry = move || {
            if !honour_entry_requests(&promise) {
                return;
            }

            if let Some(f) = f.take() {
                promise.notify_completed(f());
            }
        };

        self.enqueue(entry, poll_ready, scheduler_promise, id, priority, trace)?;
        Ok(future)
    }

    /// Schedules `f` to run once every future in `futures` is done. The
    /// futures move into the closure by value.
    pub fn await_all<F, L, R>(
        &mut self,
        f: F,
        priority: TaskPriority,
        trace: TaskTraceInfo,
        futures: L,
    ) -> Result<Future<R>, AllocError>
    where
        L: FutureList,
        F: FnOnce(L) -> R + Send + 'static,
        R: Send + 'static,
    {
        let views = futures.views();
        let poll_ready = Box::new(move |_elapsed: Duration| {
            if views.iter().all(FutureAny::is_done) {
                TaskReady::Yes
            } else {
                TaskReady::No
            }
        });

        self.await_with(f, priority, trace, futures, poll_ready)
    }

    /// Schedules `f` to run once any future in `futures` is done.
    pub fn await_any<F, L, R>(
        &mut self,
        f: F,
        priority: TaskPriority,
        trace: TaskTraceInfo,
        futures: L,
    ) -> Result<Future<R>, AllocError>
    where
        L: FutureList,
        F: FnOnce(L) -> R + Send + 'static,
        R: Send + 'static,
    {
        let views = futures.views();
        let poll_ready = Box::new(move |_elapsed: Duration| {
            if views.iter().any(FutureAny::is_done) {
                TaskReady::Yes
            } else {
                TaskReady::No
            }
        });

        self.await_with(f, priority, trace, futures, poll_ready)
    }

    fn await_with<F, L, R>(
        &mut self,
        f: F,
        priority: TaskPriority,
        trace: TaskTraceInfo,
        futures: L,
        poll_ready: Box<dyn FnMut(Duration) -> TaskReady + Send>,
    ) -> Result<Future<R>, AllocError>
    where
        L: FutureList,
        F: FnOnce(L) -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.allocate_task_id();
        let promise = make_promise::<R>(self.allocator)?;
        let future = promise.future();
        let scheduler_promise = PromiseAny::from(promise.share());

        let mut call = Some((f, futures));
        let entry = move || {
            if !honour_entry_requests(&promise) {
                return;
            }

            if let Some((f, futures)) = call.take() {
                promise.notify_completed(f(futures));
            }
        };

        self.enqueue(entry, poll_ready, scheduler_promise, id, priority, trace)?;
        Ok(future)
    }
}
