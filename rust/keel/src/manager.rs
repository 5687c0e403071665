//! Polymorphic resource lifetime management.
//!
//! A [`Manager`] is a thin handle to a [`ManagerHandle`] that knows how to
//! retain and release one particular resource. The resource can be intrusive
//! (the control block is its own manager, as built by [`crate::rc::make`])
//! or have no lifetime at all ([`static_storage_manager`], [`noop_manager`]).

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing implementation of a resource manager.
///
/// `retain` may be called any number of times; `release` must be called
/// exactly once per prior `retain`, plus once for the initial reference. A
/// resource with a positive count must stay valid.
pub trait ManagerHandle: Send + Sync {
    /// Increases the strong count of the associated resource.
    fn retain(&self);

    /// Releases one strong count of the associated resource.
    fn release(&self);
}

struct StaticStorageManagerHandle;

impl ManagerHandle for StaticStorageManagerHandle {
    fn retain(&self) {}
    fn release(&self) {}
}

struct NoopManagerHandle;

impl ManagerHandle for NoopManagerHandle {
    fn retain(&self) {}
    fn release(&self) {}
}

static STATIC_STORAGE_MANAGER_HANDLE: StaticStorageManagerHandle = StaticStorageManagerHandle;
static NOOP_MANAGER_HANDLE: NoopManagerHandle = NoopManagerHandle;

/// Cheap handle to a polymorphic resource manager.
///
/// Cloning a `Manager` aliases the same underlying manager without touching
/// the count; counting is driven by [`crate::rc::Rc`].
pub struct Manager {
    handle: *const dyn ManagerHandle,
}

// SAFETY: manager handles are required to be `Send + Sync`, and `Manager`
// only forwards calls to them.
unsafe impl Send for Manager {}
// SAFETY: as above.
unsafe impl Sync for Manager {}

impl Manager {
    /// Wraps a raw manager handle.
    ///
    /// # Safety
    ///
    /// `handle` must stay valid for as long as the managed resource's count
    /// is positive. The canonical way to uphold this is a control block that
    /// is its own manager and frees itself on the last release.
    pub unsafe fn from_raw(handle: *const dyn ManagerHandle) -> Self {
        Self { handle }
    }

    /// Increases the strong count of the managed resource.
    pub fn retain(&self) {
        // SAFETY: validity of `handle` is guaranteed by the `from_raw`
        // contract while the count is positive.
        unsafe { (*self.handle).retain() }
    }

    /// Releases one strong count of the managed resource.
    ///
    /// The handle must not be used again after the release that may have
    /// destroyed the resource; [`crate::rc::Rc`] enforces this by releasing
    /// only from its destructor.
    pub fn release(&self) {
        // SAFETY: as in `retain`.
        unsafe { (*self.handle).release() }
    }

    /// Returns the raw handle, for identity comparisons.
    pub fn as_raw(&self) -> *const dyn ManagerHandle {
        self.handle
    }
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        Self { handle: self.handle }
    }
}

impl Debug for Manager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("handle", &(self.handle as *const ()))
            .finish()
    }
}

/// Manager for resources in static storage; both operations are no-ops.
pub fn static_storage_manager() -> Manager {
    Manager {
        handle: &STATIC_STORAGE_MANAGER_HANDLE,
    }
}

/// Manager with no effect on the state of the program.
pub fn noop_manager() -> Manager {
    Manager {
        handle: &NOOP_MANAGER_HANDLE,
    }
}

/// Strong count of a shared resource.
///
/// Lives inside a heap control block and is never moved once observers
/// exist. The acquire decrement makes the last observer synchronise with
/// all writes that happened before the other releases.
pub struct RefCount {
    count: AtomicU64,
}

impl RefCount {
    /// Creates a count starting at `initial`.
    pub const fn new(initial: u64) -> Self {
        Self {
            count: AtomicU64::new(initial),
        }
    }

    /// Increments the count, returning the previous value.
    pub fn retain(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed)
    }

    /// Decrements the count, returning the previous value.
    ///
    /// A return value of 1 means the caller observed the final release and
    /// owns the resource's destruction.
    #[must_use]
    pub fn release(&self) -> u64 {
        self.count.fetch_sub(1, Ordering::Acquire)
    }

    /// Current count. Only meaningful for tests and diagnostics.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Debug for RefCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCount").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_returns_previous_value() {
        let count = RefCount::new(1);
        assert_eq!(count.retain(), 1);
        assert_eq!(count.retain(), 2);
        assert_eq!(count.release(), 3);
        assert_eq!(count.release(), 2);
        assert_eq!(count.release(), 1);
    }

    #[test]
    fn static_managers_are_inert() {
        let manager = static_storage_manager();
        manager.retain();
        manager.retain();
        manager.release();
        manager.release();
        manager.release();

        let alias = manager.clone();
        assert!(std::ptr::eq(
            manager.as_raw() as *const (),
            alias.as_raw() as *const ()
        ));
    }
}
