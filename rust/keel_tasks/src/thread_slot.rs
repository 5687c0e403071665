//! One-task mailboxes feeding the worker threads.

use crate::task::{SharedTaskFn, TaskId};
use crossbeam_utils::CachePadded;
use keel::future::Promise;
use keel::spin::SpinLock;
use std::fmt::{self, Debug, Formatter};

/// A task handed to a slot: the shared entry point plus the identifier the
/// timeline uses to track slot occupancy.
pub(crate) struct SlotTask {
    pub entry: SharedTaskFn,
    pub id: TaskId,
}

/// Snapshot of a slot's occupancy, taken once per tick.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct SlotQuery {
    pub can_push: bool,
    pub pending: Option<TaskId>,
    pub executing: Option<TaskId>,
}

#[derive(Default)]
struct Mailbox {
    pending: Option<SlotTask>,
    executing: Option<TaskId>,
}

/// A spin-locked mailbox holding at most one pending task and the id of the
/// task its worker is currently executing, designed so a task can be staged
/// while the previous one still runs.
///
/// Cache-line-aligned: slots are polled from their worker and written from
/// the scheduler thread, and must not false-share.
pub(crate) struct ThreadSlot {
    /// Lifecycle of the slot's worker thread.
    pub promise: Promise<()>,
    mailbox: CachePadded<SpinLock<Mailbox>>,
}

impl ThreadSlot {
    pub fn new(promise: Promise<()>) -> Self {
        Self {
            promise,
            mailbox: CachePadded::new(SpinLock::new(Mailbox::default())),
        }
    }

    /// Stages a task. `query().can_push` must have been checked first.
    pub fn push_task(&self, task: SlotTask) {
        let mut mailbox = self.mailbox.lock();
        debug_assert!(
            mailbox.pending.is_none(),
            "a task was pushed to an occupied slot without checking can_push"
        );
        mailbox.pending = Some(task);
    }

    /// Moves the pending task into the executing position and returns its
    /// entry point; clears the executing marker when the mailbox is empty.
    pub fn try_pop_task(&self) -> Option<SharedTaskFn> {
        let mut mailbox = self.mailbox.lock();
        mailbox.executing = None;
        let task = mailbox.pending.take()?;
        mailbox.executing = Some(task.id);
        Some(task.entry)
    }

    /// Takes an occupancy snapshot.
    pub fn query(&self) -> SlotQuery {
        let mailbox = self.mailbox.lock();
        SlotQuery {
            can_push: mailbox.pending.is_none(),
            pending: mailbox.pending.as_ref().map(|task| task.id),
            executing: mailbox.executing,
        }
    }
}

impl Debug for ThreadSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let query = self.query();
        f.debug_struct("ThreadSlot")
            .field("pending", &query.pending)
            .field("executing", &query.executing)
            .finish_non_exhaustive()
    }
}
