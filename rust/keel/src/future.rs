//! Shared future/promise state with cooperative cancelation, suspension and
//! preemption.
//!
//! The state is split across two orthogonal axes. The *informational* status
//! tells the user what the executor is currently doing and carries no data;
//! it is written and read in relaxed order and must not be relied upon. The
//! *terminal* status ([`FutureStatus::Canceled`] / [`FutureStatus::Completed`])
//! is written at most once through a compare-and-swap and is the only status
//! with result semantics: the release store of `Completed` publishes the
//! value in the storage slot to any consumer that acquires it.
//!
//! Cancel, suspend and preempt are *requests*: flags the user (or the
//! scheduler, for preempt) sets and a well-behaved task polls at its
//! cooperation points. A cancel request is sticky; suspend and resume are
//! last-write-wins; preempt is set and cleared only by the scheduler side.

use crate::alloc::{AllocError, Allocator};
use crate::rc::{self, Rc};
use crate::spin::{SpinGuard, SpinLock};
use atomic::Atomic;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// Observable status of an async operation.
///
/// Only the terminal states (`Canceled`, `Completed`) are guaranteed to
/// reflect a side effect on the program; the rest are informational and may
/// be skipped or never observed.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FutureStatus {
    /// Submitted to the scheduler and awaiting promotion.
    Scheduled,
    /// Handed to the execution unit.
    Submitted,
    /// Asked to yield, or not yet picked by the selection pass.
    Preempted,
    /// Currently running on an executor.
    Executing,
    /// A cancelation request is being honoured.
    Canceling,
    /// A suspension request is being honoured.
    Suspending,
    /// Suspended; excluded from scheduling until resumed.
    Suspended,
    /// Returning from the suspended state.
    Resuming,
    /// Terminal: the operation was canceled.
    Canceled,
    /// The result is being published.
    Completing,
    /// Terminal: the result is available.
    Completed,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InfoStatus {
    Scheduled,
    Submitted,
    Preempted,
    Executing,
    Canceling,
    Suspending,
    Suspended,
    Resuming,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TerminalStatus {
    Pending,
    Canceled,
    Completing,
    Completed,
}

/// State of the cancelation request flag. Monotonic: once `Canceled`, the
/// flag never goes back.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelRequest {
    /// No cancelation requested.
    Executing,
    /// Cancelation requested.
    Canceled,
}

/// State of the suspension request flag. The last request wins.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SuspendRequest {
    /// Resumption requested (or nothing ever requested).
    Executing,
    /// Suspension requested.
    Suspended,
}

/// State of the preemption request flag. Set and cleared only by the
/// scheduler side.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PreemptRequest {
    /// No preemption requested.
    Executing,
    /// Preemption requested.
    Preempted,
}

/// The kind of request a task observed at a cooperation point.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    /// A suspension request.
    Suspend,
    /// A cancelation request.
    Cancel,
    /// A preemption request.
    Preempt,
}

/// Returned by staged tasks to say why they yielded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ServiceToken(pub RequestType);

/// Error returned when a consumer asks for a result that is not (or will
/// never be) available.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FutureError {
    /// The operation has not reached a terminal state yet.
    Pending,
    /// The operation was canceled.
    Canceled,
}

impl Display for FutureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FutureError::Pending => f.write_str("pending"),
            FutureError::Canceled => f.write_str("canceled"),
        }
    }
}

impl std::error::Error for FutureError {}

// the status and request enums travel through `Atomic` and must stay
// byte-sized
static_assertions::assert_eq_size!(FutureStatus, u8);
static_assertions::assert_eq_size!(CancelRequest, u8);

/// The type-erased core shared by producer and consumer: both status axes
/// plus the three request flags. Always lives behind an [`Rc`]; there is no
/// by-value API.
pub struct FutureBaseState {
    info: Atomic<InfoStatus>,
    term: Atomic<TerminalStatus>,
    cancel_request: Atomic<CancelRequest>,
    suspend_request: Atomic<SuspendRequest>,
    preempt_request: Atomic<PreemptRequest>,
}

impl FutureBaseState {
    fn new() -> Self {
        Self {
            info: Atomic::new(InfoStatus::Scheduled),
            term: Atomic::new(TerminalStatus::Pending),
            cancel_request: Atomic::new(CancelRequest::Executing),
            suspend_request: Atomic::new(SuspendRequest::Executing),
            preempt_request: Atomic::new(PreemptRequest::Executing),
        }
    }

    // Informational statuses carry no data and need no ordering.
    fn notify_info(&self, status: InfoStatus) {
        self.info.store(status, Ordering::Relaxed);
    }

    // The terminal status is written at most once; losers of the race leave
    // the first terminal state in place.
    fn notify_canceled(&self) {
        let _ = self.term.compare_exchange(
            TerminalStatus::Pending,
            TerminalStatus::Canceled,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn begin_completing(&self) -> bool {
        self.term
            .compare_exchange(
                TerminalStatus::Pending,
                TerminalStatus::Completing,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn finish_completing(&self) {
        self.term.store(TerminalStatus::Completed, Ordering::Release);
    }

    /// The terminal status overrides the informational status and is always
    /// checked first. `terminal_order` is `Acquire` on the result paths so
    /// the storage write happens-before the read.
    fn fetch_status(&self, terminal_order: Ordering) -> FutureStatus {
        match self.term.load(terminal_order) {
            TerminalStatus::Pending => match self.info.load(Ordering::Relaxed) {
                InfoStatus::Scheduled => FutureStatus::Scheduled,
                InfoStatus::Submitted => FutureStatus::Submitted,
                InfoStatus::Preempted => FutureStatus::Preempted,
                InfoStatus::Executing => FutureStatus::Executing,
                InfoStatus::Canceling => FutureStatus::Canceling,
                InfoStatus::Suspending => FutureStatus::Suspending,
                InfoStatus::Suspended => FutureStatus::Suspended,
                InfoStatus::Resuming => FutureStatus::Resuming,
            },
            TerminalStatus::Canceled => FutureStatus::Canceled,
            TerminalStatus::Completing => FutureStatus::Completing,
            TerminalStatus::Completed => FutureStatus::Completed,
        }
    }

    fn is_done(&self) -> bool {
        matches!(
            self.fetch_status(Ordering::Relaxed),
            FutureStatus::Canceled | FutureStatus::Completed
        )
    }

    fn request_cancel(&self) {
        self.cancel_request.store(CancelRequest::Canceled, Ordering::Relaxed);
    }

    fn request_suspend(&self) {
        self.suspend_request.store(SuspendRequest::Suspended, Ordering::Relaxed);
    }

    fn request_resume(&self) {
        self.suspend_request.store(SuspendRequest::Executing, Ordering::Relaxed);
    }

    fn request_preempt(&self) {
        self.preempt_request.store(PreemptRequest::Preempted, Ordering::Relaxed);
    }

    fn clear_preempt_request(&self) {
        self.preempt_request.store(PreemptRequest::Executing, Ordering::Relaxed);
    }

    fn fetch_cancel_request(&self) -> CancelRequest {
        self.cancel_request.load(Ordering::Relaxed)
    }

    fn fetch_suspend_request(&self) -> SuspendRequest {
        self.suspend_request.load(Ordering::Relaxed)
    }

    fn fetch_preempt_request(&self) -> PreemptRequest {
        self.preempt_request.load(Ordering::Relaxed)
    }
}

impl Debug for FutureBaseState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureBaseState")
            .field("status", &self.fetch_status(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Shared state of a typed async operation: the base state plus the result
/// slot.
///
/// The spin lock serialises consumers copying the value out among
/// themselves; the happens-before edge for the value itself is the
/// release/acquire pair on the terminal status.
pub struct FutureState<T> {
    base: FutureBaseState,
    storage: SpinLock<Option<T>>,
}

impl<T> FutureState<T> {
    fn new() -> Self {
        Self {
            base: FutureBaseState::new(),
            storage: SpinLock::new(None),
        }
    }

    /// Publishes the result. Only the first terminal transition wins; a
    /// loser's value is dropped here.
    fn complete_with(&self, value: T) {
        if !self.base.begin_completing() {
            return;
        }

        // Single producer: the CAS above admitted exactly one completer, and
        // no consumer touches the slot before observing `Completed`.
        *self.storage.lock() = Some(value);
        self.base.finish_completing();
    }

    fn copy_result(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        match self.base.fetch_status(Ordering::Acquire) {
            FutureStatus::Completed => self.storage.lock().clone().ok_or(FutureError::Pending),
            FutureStatus::Canceled => Err(FutureError::Canceled),
            _ => Err(FutureError::Pending),
        }
    }

    fn take_result(&self) -> Result<T, FutureError> {
        match self.base.fetch_status(Ordering::Acquire) {
            FutureStatus::Completed => self.storage.lock().take().ok_or(FutureError::Pending),
            FutureStatus::Canceled => Err(FutureError::Canceled),
            _ => Err(FutureError::Pending),
        }
    }

    fn guard_result(&self) -> Result<ValueGuard<'_, T>, FutureError> {
        match self.base.fetch_status(Ordering::Acquire) {
            FutureStatus::Completed => {
                let guard = self.storage.lock();
                if guard.is_some() {
                    Ok(ValueGuard { guard })
                } else {
                    Err(FutureError::Pending)
                }
            }
            FutureStatus::Canceled => Err(FutureError::Canceled),
            _ => Err(FutureError::Pending),
        }
    }
}

impl<T> Debug for FutureState<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureState").field("base", &self.base).finish_non_exhaustive()
    }
}

/// Shared reference to a published result. Holds the storage lock for the
/// lifetime of the borrow; keep it short.
pub struct ValueGuard<'a, T> {
    guard: SpinGuard<'a, Option<T>>,
}

impl<T> Deref for ValueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("occupancy was checked when the guard was taken")
    }
}

type SharedState<T> = Rc<NonNull<FutureState<T>>>;

fn erase<T>(state: SharedState<T>) -> Rc<NonNull<FutureBaseState>> {
    let base = NonNull::from(&state.base);
    rc::transmute(base, state)
}

/// Consumer-side view of an async operation.
pub struct Future<T> {
    state: SharedState<T>,
}

impl<T> Future<T> {
    /// Current status. Informational except for the terminal states.
    pub fn fetch_status(&self) -> FutureStatus {
        self.state.base.fetch_status(Ordering::Relaxed)
    }

    /// `true` once the operation is `Canceled` or `Completed`.
    pub fn is_done(&self) -> bool {
        self.state.base.is_done()
    }

    /// Requests cooperative cancelation. Sticky.
    pub fn request_cancel(&self) {
        self.state.base.request_cancel();
    }

    /// Requests cooperative suspension.
    pub fn request_suspend(&self) {
        self.state.base.request_suspend();
    }

    /// Requests resumption after a suspension request.
    pub fn request_resume(&self) {
        self.state.base.request_resume();
    }

    /// Copies the result out.
    pub fn copy(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.state.copy_result()
    }

    /// Moves the result out, leaving the future empty; later `copy`, `take`
    /// or `get` calls report [`FutureError::Pending`].
    pub fn take(&self) -> Result<T, FutureError> {
        self.state.take_result()
    }

    /// Borrows the result under the storage lock.
    pub fn get(&self) -> Result<ValueGuard<'_, T>, FutureError> {
        self.state.guard_result()
    }

    /// Creates another view of the same operation.
    pub fn share(&self) -> Future<T> {
        Future {
            state: self.state.share(),
        }
    }
}

impl<T> Debug for Future<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("status", &self.fetch_status()).finish_non_exhaustive()
    }
}

/// Producer-side view of an async operation.
///
/// The `notify_*` operations publish executor progress; `request_*` and
/// `fetch_*_request` mirror the user-side flags so an executor can service
/// them.
pub struct Promise<T> {
    state: SharedState<T>,
}

impl<T> Promise<T> {
    /// The operation is scheduled for execution.
    pub fn notify_scheduled(&self) {
        self.state.base.notify_info(InfoStatus::Scheduled);
    }

    /// The operation was handed to an execution unit.
    pub fn notify_submitted(&self) {
        self.state.base.notify_info(InfoStatus::Submitted);
    }

    /// The operation was preempted (or is awaiting selection).
    pub fn notify_preempted(&self) {
        self.state.base.notify_info(InfoStatus::Preempted);
    }

    /// The operation is executing.
    pub fn notify_executing(&self) {
        self.state.base.notify_info(InfoStatus::Executing);
    }

    /// A cancelation request is being honoured.
    pub fn notify_canceling(&self) {
        self.state.base.notify_info(InfoStatus::Canceling);
    }

    /// A suspension request is being honoured.
    pub fn notify_suspending(&self) {
        self.state.base.notify_info(InfoStatus::Suspending);
    }

    /// The operation is suspended.
    pub fn notify_suspended(&self) {
        self.state.base.notify_info(InfoStatus::Suspended);
    }

    /// The operation is resuming.
    pub fn notify_resuming(&self) {
        self.state.base.notify_info(InfoStatus::Resuming);
    }

    /// Terminal: the operation was canceled. A no-op if a terminal state was
    /// already reached.
    pub fn notify_canceled(&self) {
        self.state.base.notify_canceled();
    }

    /// Terminal: publishes the result. A no-op (dropping `value`) if a
    /// terminal state was already reached.
    pub fn notify_completed(&self, value: T) {
        self.state.complete_with(value);
    }

    /// See [`Future::request_cancel`].
    pub fn request_cancel(&self) {
        self.state.base.request_cancel();
    }

    /// See [`Future::request_suspend`].
    pub fn request_suspend(&self) {
        self.state.base.request_suspend();
    }

    /// See [`Future::request_resume`].
    pub fn request_resume(&self) {
        self.state.base.request_resume();
    }

    /// Asks the task to yield at its next cooperation point.
    pub fn request_preempt(&self) {
        self.state.base.request_preempt();
    }

    /// Withdraws a preemption request.
    pub fn clear_preempt_request(&self) {
        self.state.base.clear_preempt_request();
    }

    /// Reads the cancelation request flag.
    pub fn fetch_cancel_request(&self) -> CancelRequest {
        self.state.base.fetch_cancel_request()
    }

    /// Reads the suspension request flag.
    pub fn fetch_suspend_request(&self) -> SuspendRequest {
        self.state.base.fetch_suspend_request()
    }

    /// Reads the preemption request flag.
    pub fn fetch_preempt_request(&self) -> PreemptRequest {
        self.state.base.fetch_preempt_request()
    }

    /// See [`Future::fetch_status`].
    pub fn fetch_status(&self) -> FutureStatus {
        self.state.base.fetch_status(Ordering::Relaxed)
    }

    /// See [`Future::is_done`].
    pub fn is_done(&self) -> bool {
        self.state.base.is_done()
    }

    /// A consumer view of the operation.
    pub fn future(&self) -> Future<T> {
        Future {
            state: self.state.share(),
        }
    }

    /// Creates another producer view of the same operation.
    pub fn share(&self) -> Promise<T> {
        Promise {
            state: self.state.share(),
        }
    }
}

impl<T> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("status", &self.fetch_status()).finish_non_exhaustive()
    }
}

macro_rules! forward_base_api {
    ($name:ident, notify) => {
        impl $name {
            /// See [`Promise::notify_scheduled`].
            pub fn notify_scheduled(&self) {
                self.state.notify_info(InfoStatus::Scheduled);
            }

            /// See [`Promise::notify_submitted`].
            pub fn notify_submitted(&self) {
                self.state.notify_info(InfoStatus::Submitted);
            }

            /// See [`Promise::notify_preempted`].
            pub fn notify_preempted(&self) {
                self.state.notify_info(InfoStatus::Preempted);
            }

            /// See [`Promise::notify_executing`].
            pub fn notify_executing(&self) {
                self.state.notify_info(InfoStatus::Executing);
            }

            /// See [`Promise::notify_canceling`].
            pub fn notify_canceling(&self) {
                self.state.notify_info(InfoStatus::Canceling);
            }

            /// See [`Promise::notify_suspending`].
            pub fn notify_suspending(&self) {
                self.state.notify_info(InfoStatus::Suspending);
            }

            /// See [`Promise::notify_suspended`].
            pub fn notify_suspended(&self) {
                self.state.notify_info(InfoStatus::Suspended);
            }

            /// See [`Promise::notify_resuming`].
            pub fn notify_resuming(&self) {
                self.state.notify_info(InfoStatus::Resuming);
            }

            /// See [`Promise::notify_canceled`].
            pub fn notify_canceled(&self) {
                self.state.notify_canceled();
            }

            /// See [`Promise::request_preempt`].
            pub fn request_preempt(&self) {
                self.state.request_preempt();
            }

            /// See [`Promise::clear_preempt_request`].
            pub fn clear_preempt_request(&self) {
                self.state.clear_preempt_request();
            }
        }
    };
    ($name:ident, observe) => {
        impl $name {
            /// See [`Future::fetch_status`].
            pub fn fetch_status(&self) -> FutureStatus {
                self.state.fetch_status(Ordering::Relaxed)
            }

            /// See [`Future::is_done`].
            pub fn is_done(&self) -> bool {
                self.state.is_done()
            }

            /// See [`Future::request_cancel`].
            pub fn request_cancel(&self) {
                self.state.request_cancel();
            }

            /// See [`Future::request_suspend`].
            pub fn request_suspend(&self) {
                self.state.request_suspend();
            }

            /// See [`Future::request_resume`].
            pub fn request_resume(&self) {
                self.state.request_resume();
            }

            /// See [`Promise::fetch_cancel_request`].
            pub fn fetch_cancel_request(&self) -> CancelRequest {
                self.state.fetch_cancel_request()
            }

            /// See [`Promise::fetch_suspend_request`].
            pub fn fetch_suspend_request(&self) -> SuspendRequest {
                self.state.fetch_suspend_request()
            }

            /// See [`Promise::fetch_preempt_request`].
            pub fn fetch_preempt_request(&self) -> PreemptRequest {
                self.state.fetch_preempt_request()
            }
        }
    };
}

/// Type-erased consumer view, for containers that hold heterogeneous
/// futures. No result access.
#[derive(Debug)]
pub struct FutureAny {
    state: Rc<NonNull<FutureBaseState>>,
}

forward_base_api!(FutureAny, observe);

impl FutureAny {
    /// Creates another view of the same operation.
    pub fn share(&self) -> FutureAny {
        FutureAny {
            state: self.state.share(),
        }
    }
}

impl<T> From<Future<T>> for FutureAny {
    fn from(future: Future<T>) -> Self {
        FutureAny {
            state: erase(future.state),
        }
    }
}

/// Type-erased producer view. Every lifecycle notification except result
/// publication.
#[derive(Debug)]
pub struct PromiseAny {
    state: Rc<NonNull<FutureBaseState>>,
}

forward_base_api!(PromiseAny, notify);
forward_base_api!(PromiseAny, observe);

impl PromiseAny {
    /// A type-erased consumer view of the operation.
    pub fn future(&self) -> FutureAny {
        FutureAny {
            state: self.state.share(),
        }
    }

    /// Creates another producer view of the same operation.
    pub fn share(&self) -> PromiseAny {
        PromiseAny {
            state: self.state.share(),
        }
    }
}

impl<T> From<Promise<T>> for PromiseAny {
    fn from(promise: Promise<T>) -> Self {
        PromiseAny {
            state: erase(promise.state),
        }
    }
}

/// Read-only view of the request flags, for polling from inside a task at
/// its cooperation points.
#[derive(Debug)]
pub struct RequestProxy {
    state: Rc<NonNull<FutureBaseState>>,
}

impl RequestProxy {
    /// Reads the cancelation request flag.
    pub fn fetch_cancel_request(&self) -> CancelRequest {
        self.state.fetch_cancel_request()
    }

    /// Reads the suspension request flag.
    pub fn fetch_suspend_request(&self) -> SuspendRequest {
        self.state.fetch_suspend_request()
    }

    /// Reads the preemption request flag.
    pub fn fetch_preempt_request(&self) -> PreemptRequest {
        self.state.fetch_preempt_request()
    }

    /// Creates another proxy onto the same flags.
    pub fn share(&self) -> RequestProxy {
        RequestProxy {
            state: self.state.share(),
        }
    }
}

impl<T> From<&Promise<T>> for RequestProxy {
    fn from(promise: &Promise<T>) -> Self {
        RequestProxy {
            state: erase(promise.state.share()),
        }
    }
}

impl<T> From<&Future<T>> for RequestProxy {
    fn from(future: &Future<T>) -> Self {
        RequestProxy {
            state: erase(future.state.share()),
        }
    }
}

impl From<&PromiseAny> for RequestProxy {
    fn from(promise: &PromiseAny) -> Self {
        RequestProxy {
            state: promise.state.share(),
        }
    }
}

impl From<&FutureAny> for RequestProxy {
    fn from(future: &FutureAny) -> Self {
        RequestProxy {
            state: future.state.share(),
        }
    }
}

/// Allocates the shared state of a new async operation and returns its
/// producer view.
pub fn make_promise<T>(alloc: Allocator) -> Result<Promise<T>, AllocError>
where
    T: Send + 'static,
{
    let state = rc::make(alloc, FutureState::<T>::new())?;
    Ok(Promise { state })
}
