//! Reference-counted and unique resource handles.
//!
//! An [`Rc`] pairs a movable handle with a [`Manager`] that owns the
//! resource's lifetime. The handle can be a pointer into a heap block (see
//! [`make`]), a borrowed static value (see [`make_static`]) or any other
//! movable value; validity is the manager's business, which is what makes
//! [`transmute`] possible: a derived handle (a field, a view) can be bound
//! to the manager of the resource it was derived from, at zero refcount
//! traffic.

use crate::alloc::{AllocError, Allocator};
use crate::manager::{static_storage_manager, Manager, ManagerHandle, RefCount};
use std::alloc::Layout;
use std::fmt::{self, Debug, Formatter};
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::{addr_of_mut, NonNull};

/// A shared, reference-counted resource handle.
///
/// `Rc` is not implicitly copyable; [`Rc::share`] is the only way to create
/// another reference. Dropping an `Rc` releases the manager exactly once.
pub struct Rc<H> {
    handle: H,
    manager: Manager,
}

impl<H> Rc<H> {
    /// Assembles an `Rc` from a handle and a manager.
    ///
    /// The caller is responsible for an initial count of 1 having been
    /// established on `manager` for this reference.
    pub fn new(handle: H, manager: Manager) -> Self {
        Self { handle, manager }
    }

    /// The wrapped handle.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// The resource manager.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Creates another reference to the same resource.
    pub fn share(&self) -> Rc<H>
    where
        H: Clone,
    {
        self.manager.retain();
        Rc {
            handle: self.handle.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl<H> Drop for Rc<H> {
    fn drop(&mut self) {
        self.manager.release();
    }
}

impl<H: Debug> Debug for Rc<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rc").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for Rc<NonNull<T>> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: pointer handles produced by this module point into
        // resources the manager keeps alive while our count is positive.
        unsafe { self.handle.as_ref() }
    }
}

// The manual impls below suppress the automatic `Send`/`Sync` derivation
// for every handle shape, so each supported shape is spelled out: raw
// pointer handles (the heap blocks of `make`) and borrowed static handles
// (`make_static`).

// SAFETY: the manager is `Send + Sync`; a pointer handle may move across
// threads when the pointee allows shared cross-thread access.
unsafe impl<T: ?Sized + Send + Sync> Send for Rc<NonNull<T>> {}
// SAFETY: as above; `Rc` hands out only shared references to the pointee.
unsafe impl<T: ?Sized + Send + Sync> Sync for Rc<NonNull<T>> {}
// SAFETY: a shared reference crosses threads when the pointee is `Sync`.
unsafe impl<T: ?Sized + Sync> Send for Rc<&'static T> {}
// SAFETY: as above.
unsafe impl<T: ?Sized + Sync> Sync for Rc<&'static T> {}

/// A uniquely owned resource handle.
///
/// Like [`Rc`] but without `share`; the single reference releases the
/// manager exactly once when dropped.
pub struct Unique<H> {
    handle: H,
    manager: Manager,
}

impl<H> Unique<H> {
    /// Assembles a `Unique` from a handle and a manager holding a count
    /// of 1 for this reference.
    pub fn new(handle: H, manager: Manager) -> Self {
        Self { handle, manager }
    }

    /// The wrapped handle.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// The resource manager.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }
}

impl<H> Drop for Unique<H> {
    fn drop(&mut self) {
        self.manager.release();
    }
}

impl<H: Debug> Debug for Unique<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unique").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for Unique<NonNull<T>> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: as for `Rc<NonNull<T>>`.
        unsafe { self.handle.as_ref() }
    }
}

// SAFETY: as for `Rc<NonNull<T>>`.
unsafe impl<T: ?Sized + Send + Sync> Send for Unique<NonNull<T>> {}
// SAFETY: as for `Rc<NonNull<T>>`.
unsafe impl<T: ?Sized + Send + Sync> Sync for Unique<NonNull<T>> {}
// SAFETY: as for `Rc<&'static T>`.
unsafe impl<T: ?Sized + Sync> Send for Unique<&'static T> {}
// SAFETY: as for `Rc<&'static T>`.
unsafe impl<T: ?Sized + Sync> Sync for Unique<&'static T> {}

fn into_parts<H>(source: Rc<H>) -> (H, Manager) {
    let source = ManuallyDrop::new(source);
    let manager = source.manager.clone();
    // SAFETY: `source` is never dropped, so the handle is read out exactly
    // once and the reference it held moves to the caller.
    let handle = unsafe { std::ptr::read(&source.handle) };
    (handle, manager)
}

/// Binds a derived handle to the manager of `source`.
///
/// The new `Rc` is valid for as long as any reference to the original
/// resource is; no refcount traffic happens.
pub fn transmute<Target, Source>(target: Target, source: Rc<Source>) -> Rc<Target> {
    let (handle, manager) = into_parts(source);
    drop(handle);
    Rc::new(target, manager)
}

/// Converts the handle of `source` into `Target` via [`From`].
pub fn cast<Target, Source>(source: Rc<Source>) -> Rc<Target>
where
    Source: Into<Target>,
{
    let (handle, manager) = into_parts(source);
    Rc::new(handle.into(), manager)
}

/// [`transmute`] for unique handles.
pub fn transmute_unique<Target, Source>(target: Target, source: Unique<Source>) -> Unique<Target> {
    let source = ManuallyDrop::new(source);
    let manager = source.manager.clone();
    // SAFETY: `source` is never dropped; its single reference moves to the
    // new handle.
    drop(unsafe { std::ptr::read(&source.handle) });
    Unique::new(target, manager)
}

/// Control block for heap resources made by [`make`]: count, allocator and
/// value share one allocation, and the block is its own manager.
struct RcBlock<T> {
    refs: RefCount,
    alloc: Allocator,
    value: T,
}

impl<T: Send + Sync> ManagerHandle for RcBlock<T> {
    fn retain(&self) {
        self.refs.retain();
    }

    fn release(&self) {
        if self.refs.release() != 1 {
            return;
        }

        let alloc = self.alloc;
        let layout = Layout::new::<Self>();
        let ptr = self as *const Self as *mut Self;
        // SAFETY: we observed the final release, so no other reference can
        // reach the block, and the acquire decrement ordered all writes from
        // other threads before this point.
        unsafe {
            std::ptr::drop_in_place(ptr);
            alloc.deallocate(NonNull::new_unchecked(ptr.cast::<u8>()), layout);
        }
    }
}

fn make_block<T>(alloc: Allocator, value: T) -> Result<NonNull<RcBlock<T>>, AllocError>
where
    T: Send + Sync + 'static,
{
    let layout = Layout::new::<RcBlock<T>>();
    let block = alloc.allocate(layout)?.cast::<RcBlock<T>>();

    // SAFETY: `block` is a fresh allocation of the right layout.
    unsafe {
        block.as_ptr().write(RcBlock {
            refs: RefCount::new(1),
            alloc,
            value,
        });
    }

    Ok(block)
}

fn block_parts<T>(block: NonNull<RcBlock<T>>) -> (NonNull<T>, Manager)
where
    T: Send + Sync + 'static,
{
    // SAFETY: the block was just initialized; the projection does not read.
    let value = unsafe { NonNull::new_unchecked(addr_of_mut!((*block.as_ptr()).value)) };
    // SAFETY: the block manages itself and deallocates only on the final
    // release, which upholds the `Manager::from_raw` contract.
    let manager = unsafe { Manager::from_raw(block.as_ptr() as *const dyn ManagerHandle) };
    (value, manager)
}

/// Allocates `value` into a fresh, reference-counted control block.
///
/// Failure is only possible here; once constructed, sharing and dropping
/// cannot fail.
pub fn make<T>(alloc: Allocator, value: T) -> Result<Rc<NonNull<T>>, AllocError>
where
    T: Send + Sync + 'static,
{
    let block = make_block(alloc, value)?;
    let (value, manager) = block_parts(block);
    Ok(Rc::new(value, manager))
}

/// Allocates `value` into a control block owned by a single reference.
pub fn unique<T>(alloc: Allocator, value: T) -> Result<Unique<NonNull<T>>, AllocError>
where
    T: Send + Sync + 'static,
{
    let block = make_block(alloc, value)?;
    let (value, manager) = block_parts(block);
    Ok(Unique::new(value, manager))
}

/// Wraps a value in static storage; retain and release are no-ops.
pub fn make_static<T: ?Sized>(value: &'static T) -> Rc<&'static T> {
    Rc::new(value, static_storage_manager())
}
