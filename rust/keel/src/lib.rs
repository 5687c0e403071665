//! Systems foundation for cooperative task execution.
//!
//! The crate provides the building blocks the [`keel_tasks`] scheduler is
//! assembled from:
//!
//! - [`alloc`]: a pluggable, fallible allocator handle. Every allocating
//!   entry point in the crate surfaces [`alloc::AllocError`] instead of
//!   aborting.
//! - [`manager`] and [`rc`]: polymorphic lifetime management. An
//!   [`rc::Rc`] pairs an arbitrary movable handle with a [`manager::Manager`]
//!   and supports aliasing a derived handle onto the same resource
//!   ([`rc::transmute`]).
//! - [`spin`]: a spin lock and an exponential-backoff spin waiter for the
//!   short critical sections used throughout.
//! - [`future`]: the shared future/promise state machine with cooperative
//!   cancelation, suspension and preemption.
//!
//! The vocabulary for fallible and optional values is the standard library's
//! [`Option`] and [`Result`] together with `?`; [`ext`] adds the few
//! accessors stable Rust does not provide.
//!
//! [`keel_tasks`]: https://docs.rs/keel_tasks

pub mod alloc;
pub mod ext;
pub mod future;
pub mod manager;
pub mod rc;
pub mod spin;

pub use alloc::{AllocError, Allocator, OS_ALLOCATOR};
pub use future::{make_promise, Future, FutureAny, FutureError, FutureStatus, Promise, PromiseAny, RequestProxy};
pub use rc::{Rc, Unique};
