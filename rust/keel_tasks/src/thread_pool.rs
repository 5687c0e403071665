//! Worker threads draining the slot mailboxes.

use crate::thread_slot::ThreadSlot;
use keel::alloc::{AllocError, Allocator};
use keel::future::{make_promise, CancelRequest, FutureAny, Promise};
use keel::rc::{self, Rc};
use log::{info, trace};
use std::ptr::NonNull;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound of the eventless-poll backoff sleep.
pub(crate) const STALL_TIMEOUT: Duration = Duration::from_millis(16);

/// Minimum period between polls of the worker's cancelation flag.
pub(crate) const CANCELATION_POLL_MIN_PERIOD: Duration = Duration::from_millis(32);

static_assertions::const_assert!(STALL_TIMEOUT.as_millis() % 2 == 0);
static_assertions::const_assert!(CANCELATION_POLL_MIN_PERIOD.as_millis() % STALL_TIMEOUT.as_millis() == 0);

// sleep: 2ms -> 4ms -> 8ms -> 16ms -> ... clamped at `maximum`.
//
// nanosecond/microsecond sleeps typically don't save much power.
pub(crate) fn bounded_exponential_backoff(iteration: u64, maximum: Duration) -> Duration {
    let delay = 1u64 << iteration.min(31);
    Duration::from_millis(delay).min(maximum)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PoolState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// A fixed set of worker threads, each owning one [`ThreadSlot`], plus a
/// future representing the pool's own shutdown.
pub(crate) struct ThreadPool {
    slots: Vec<Rc<NonNull<ThreadSlot>>>,
    threads: Vec<JoinHandle<()>>,
    promise: Promise<()>,
    state: PoolState,
}

impl ThreadPool {
    /// Spawns `workers` threads, defaulting to `max(1, hw_concurrency)`.
    /// `Some(0)` builds a slot-less pool that can still be ticked.
    pub fn new(alloc: Allocator, workers: Option<usize>) -> Result<Self, AllocError> {
        let count = workers.unwrap_or_else(|| num_cpus::get().max(1));
        info!("starting thread pool with {count} workers");

        let promise = make_promise::<()>(alloc)?;
        promise.notify_executing();

        let mut slots = Vec::new();
        slots.try_reserve(count).map_err(|_| AllocError::OutOfMemory)?;
        for _ in 0..count {
            let slot = ThreadSlot::new(make_promise::<()>(alloc)?);
            slots.push(rc::make(alloc, slot)?);
        }

        let mut threads = Vec::new();
        threads.try_reserve(count).map_err(|_| AllocError::OutOfMemory)?;
        for (index, slot) in slots.iter().enumerate() {
            let slot = slot.share();
            let thread = std::thread::Builder::new()
                .name(format!("keel-worker-{index}"))
                .spawn(move || worker_main(slot))
                .map_err(|_| AllocError::OutOfMemory)?;
            threads.push(thread);
        }

        Ok(Self {
            slots,
            threads,
            promise,
            state: PoolState::Running,
        })
    }

    /// The slots tasks are dispatched onto.
    pub fn slots(&self) -> &[Rc<NonNull<ThreadSlot>>] {
        &self.slots
    }

    /// The pool's shutdown future. Requesting cancel on it starts the
    /// shutdown sequence on the next tick.
    pub fn future(&self) -> FutureAny {
        FutureAny::from(self.promise.future())
    }

    /// Advances the shutdown state machine.
    pub fn tick(&mut self, _interval: Duration) {
        match self.state {
            PoolState::Running => {
                if self.promise.fetch_cancel_request() == CancelRequest::Canceled {
                    info!("thread pool cancelation requested, stopping {} workers", self.slots.len());
                    for slot in &self.slots {
                        slot.promise.request_cancel();
                    }
                    self.state = PoolState::ShuttingDown;
                }
            }
            PoolState::ShuttingDown => {
                if self.slots.iter().all(|slot| slot.promise.is_done()) {
                    self.state = PoolState::Shutdown;
                    self.promise.notify_canceled();
                    info!("thread pool shut down");
                }
            }
            PoolState::Shutdown => {}
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        info!("shutting down worker pool");

        for slot in &self.slots {
            slot.promise.request_cancel();
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.slots.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn worker_main(slot: Rc<NonNull<ThreadSlot>>) {
    let mut eventless_polls: u64 = 0;

    loop {
        if slot.promise.fetch_cancel_request() == CancelRequest::Canceled {
            trace!("worker exiting on cancel request");
            slot.promise.notify_canceled();
            return;
        }

        // keep polling for tasks as long as we are within the time limit;
        // once it is reached we go back to polling for cancelation
        let poll_begin = Instant::now();
        let mut now = poll_begin;
        while now - poll_begin < CANCELATION_POLL_MIN_PERIOD {
            if let Some(entry) = slot.try_pop_task() {
                // SAFETY: the timeline binds a task to at most one slot, so
                // this worker is the entry point's only invoker right now.
                unsafe { entry.call() };
                eventless_polls = 0;
            } else {
                eventless_polls += 1;
                std::thread::sleep(bounded_exponential_backoff(eventless_polls, STALL_TIMEOUT));
            }

            now = Instant::now();
        }
    }
}
