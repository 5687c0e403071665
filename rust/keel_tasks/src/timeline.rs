//! The fairness timeline: starvation-ordered, priority-tie-broken selection
//! of ready tasks onto thread slots.
//!
//! Tasks land here once their readiness predicate fires. Each tick the
//! timeline refreshes its view of every task's status, resumes tasks whose
//! suspension request was withdrawn, reaps terminal tasks, selects a
//! fair+prioritized subset for the available slots, politely asks everyone
//! else to yield, and fills free slots with the selection.
//!
//! Suspension, preemption and cancelation are *not* serviced here; the
//! tasks themselves observe their request flags at their cooperation
//! points. The timeline only reads statuses and sets request flags, so a
//! fine-grained task is canceled as soon as its current phase finishes and
//! no scheduling effort is wasted on it.

use crate::task::{SharedTaskFn, TaskId, TaskPriority};
use crate::thread_slot::{SlotQuery, SlotTask, ThreadSlot};
use keel::alloc::AllocError;
use keel::ext::OptionExt;
use keel::future::{FutureStatus, PromiseAny, SuspendRequest};
use keel::rc::Rc;
use log::{debug, trace};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// Base width of the starvation window used by the selection pass.
pub(crate) const STARVATION_PERIOD: Duration = Duration::from_millis(64);

/// Granularity by which the window is widened when slots would stay empty.
const STARVATION_QUANTUM: Duration = Duration::from_millis(16);

/// A ready task the timeline is rotating through the slots.
struct TimelineTask {
    entry: SharedTaskFn,
    promise: PromiseAny,
    id: TaskId,
    priority: TaskPriority,
    /// When the task last entered the preempted state, as observed here. The
    /// selection pass treats older timepoints as more starved.
    last_preempt_timepoint: Instant,
    /// Status cached by the last poll.
    last_status_poll: FutureStatus,
}

impl TimelineTask {
    fn is_candidate(&self) -> bool {
        matches!(
            self.last_status_poll,
            FutureStatus::Preempted | FutureStatus::Executing
        )
    }

    fn is_done(&self) -> bool {
        matches!(
            self.last_status_poll,
            FutureStatus::Completed | FutureStatus::Canceled
        )
    }
}

/// See the module docs.
#[derive(Default)]
pub(crate) struct ScheduleTimeline {
    starvation_timeline: Vec<TimelineTask>,
    slot_captures: Vec<SlotQuery>,
}

impl ScheduleTimeline {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of tasks currently rotating.
    pub fn len(&self) -> usize {
        self.starvation_timeline.len()
    }

    /// Ensures capacity for one more task, so a later [`Self::add_task`]
    /// cannot fail.
    pub fn reserve_one(&mut self) -> Result<(), AllocError> {
        self.starvation_timeline
            .try_reserve(1)
            .map_err(|_| AllocError::OutOfMemory)
    }

    /// Accepts a ready task. It enters in the preempted state, eligible for
    /// the next selection pass.
    pub fn add_task(
        &mut self,
        entry: SharedTaskFn,
        promise: PromiseAny,
        id: TaskId,
        priority: TaskPriority,
        present: Instant,
    ) -> Result<(), AllocError> {
        self.starvation_timeline
            .try_reserve(1)
            .map_err(|_| AllocError::OutOfMemory)?;

        promise.notify_preempted();
        self.starvation_timeline.push(TimelineTask {
            entry,
            promise,
            id,
            priority,
            last_preempt_timepoint: present,
            last_status_poll: FutureStatus::Preempted,
        });

        Ok(())
    }

    /// Requests cancelation of every task and terminally cancels those not
    /// currently executing on a worker.
    ///
    /// Executing tasks resolve themselves at their next cooperation point.
    /// A task staged in a mailbox but not yet running is canceled here: if
    /// its worker still pops it, the entry re-checks the cancel flag before
    /// doing any work, and the terminal CAS makes the remaining race with a
    /// completing task safe because the first terminal state wins.
    pub fn cancel_all(&mut self) {
        for task in &self.starvation_timeline {
            task.promise.request_cancel();

            let executing = self
                .slot_captures
                .iter()
                .any(|query| query.executing.contains(&task.id));
            if !executing {
                task.promise.notify_canceled();
            }
        }
    }

    fn poll_tasks(&mut self, present: Instant) {
        for task in &mut self.starvation_timeline {
            // the status may have been advanced from a worker thread
            let new_status = task.promise.fetch_status();

            if task.last_status_poll != FutureStatus::Preempted
                && new_status == FutureStatus::Preempted
            {
                task.last_preempt_timepoint = present;
            }

            task.last_status_poll = new_status;
        }
    }

    fn execute_resume_requests(&mut self, present: Instant) {
        for task in &mut self.starvation_timeline {
            if task.last_status_poll == FutureStatus::Suspended
                && task.promise.fetch_suspend_request() == SuspendRequest::Executing
            {
                // back to preempted, so the task competes for a slot in this
                // very tick's selection pass
                task.promise.notify_preempted();
                task.last_status_poll = FutureStatus::Preempted;
                task.last_preempt_timepoint = present;
            }
        }
    }

    fn remove_done_tasks(&mut self) {
        let before = self.starvation_timeline.len();
        self.starvation_timeline.retain(|task| !task.is_done());

        let reaped = before - self.starvation_timeline.len();
        if reaped > 0 {
            debug!("reaped {reaped} terminal tasks from the timeline");
        }
    }

    /// Selects up to `num_slots` tasks. Returns `(num_selected,
    /// num_candidates)`; after the call the timeline is ordered selection
    /// first, then unselected candidates, then suspended tasks.
    fn select_tasks_for_slots(&mut self, num_slots: usize) -> (usize, usize) {
        // stable partition: candidates ahead of suspended tasks
        self.starvation_timeline.sort_by_key(|task| !task.is_candidate());
        let num_candidates = self
            .starvation_timeline
            .iter()
            .take_while(|task| task.is_candidate())
            .count();

        if num_candidates == 0 {
            return (0, 0);
        }

        let candidates = &mut self.starvation_timeline[..num_candidates];

        // most starved first
        candidates.sort_by_key(|task| task.last_preempt_timepoint);
        let most_starved_timepoint = candidates[0].last_preempt_timepoint;

        // admit candidates within the starvation window; while slots would
        // stay unfilled, widen the window in whole quanta to cover the next
        // candidate
        let mut window = STARVATION_PERIOD;
        let mut admitted = 0;
        for task in candidates.iter() {
            let lag = task.last_preempt_timepoint - most_starved_timepoint;

            if lag <= window {
                admitted += 1;
            } else if admitted < num_slots {
                let deficit = lag - window;
                let quantum = STARVATION_QUANTUM.as_nanos();
                let steps = (deficit.as_nanos() + quantum - 1) / quantum;
                window += STARVATION_QUANTUM * steps as u32;
                admitted += 1;
            } else {
                break;
            }
        }

        // priority breaks ties within the admission window
        candidates[..admitted].sort_by(|a, b| b.priority.cmp(&a.priority));

        (admitted.min(num_slots), num_candidates)
    }

    /// One scheduling pass over `slots` at `present`.
    pub fn tick(&mut self, slots: &[Rc<NonNull<ThreadSlot>>], present: Instant) {
        let num_slots = slots.len();
        self.slot_captures.clear();
        self.slot_captures.extend(slots.iter().map(|slot| slot.query()));

        self.poll_tasks(present);
        self.execute_resume_requests(present);
        self.remove_done_tasks();

        if self.starvation_timeline.is_empty() {
            return;
        }

        let (num_selected, num_candidates) = self.select_tasks_for_slots(num_slots);

        // ask unselected candidates to yield; they may be running right now
        for task in &self.starvation_timeline[num_selected..num_candidates] {
            task.promise.request_preempt();
        }

        // fill free slots with the selection, skipping tasks already staged
        // or running; whoever gets no slot this tick competes again on the
        // next one
        let mut next_slot = 0;
        for task in &self.starvation_timeline[..num_selected] {
            let has_slot = self.slot_captures.iter().any(|query| {
                query.pending.contains(&task.id) || query.executing.contains(&task.id)
            });
            if has_slot {
                continue;
            }

            while next_slot < num_slots {
                if self.slot_captures[next_slot].can_push {
                    // we explicitly chose this task; withdraw any stale
                    // preempt request before it runs
                    task.promise.clear_preempt_request();
                    trace!("dispatching task {} to slot {next_slot}", task.id);
                    slots[next_slot].push_task(SlotTask {
                        entry: task.entry.share(),
                        id: task.id,
                    });
                    next_slot += 1;
                    break;
                }

                next_slot += 1;
            }
        }
    }
}

impl std::fmt::Debug for ScheduleTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleTimeline")
            .field("tasks", &self.starvation_timeline.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{make_task_fn, CRITICAL_PRIORITY, NORMAL_PRIORITY};
    use keel::alloc::OS_ALLOCATOR;
    use keel::future::{make_promise, Future, Promise};
    use keel::rc;

    struct Entry {
        timeline: ScheduleTimeline,
        promises: Vec<Promise<()>>,
        futures: Vec<Future<()>>,
    }

    fn timeline_with(tasks: &[(TaskPriority, Duration)], base: Instant) -> Entry {
        let mut timeline = ScheduleTimeline::new();
        let mut promises = Vec::new();
        let mut futures = Vec::new();

        for (index, (priority, age)) in tasks.iter().enumerate() {
            let promise = make_promise::<()>(OS_ALLOCATOR).unwrap();
            let entry = make_task_fn(OS_ALLOCATOR, || {}).unwrap();
            timeline
                .add_task(
                    entry,
                    promise.share().into(),
                    TaskId(index as u64),
                    *priority,
                    base - *age,
                )
                .unwrap();
            futures.push(promise.future());
            promises.push(promise);
        }

        Entry {
            timeline,
            promises,
            futures,
        }
    }

    fn slots(count: usize) -> Vec<Rc<NonNull<ThreadSlot>>> {
        (0..count)
            .map(|_| {
                rc::make(
                    OS_ALLOCATOR,
                    ThreadSlot::new(make_promise(OS_ALLOCATOR).unwrap()),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn terminal_tasks_are_reaped() {
        let base = Instant::now();
        let mut entry = timeline_with(&[(NORMAL_PRIORITY, Duration::ZERO); 3], base);

        entry.promises[0].notify_completed(());
        entry.promises[2].notify_canceled();

        entry.timeline.tick(&[], base);
        assert_eq!(entry.timeline.len(), 1);
    }

    #[test]
    fn starved_tasks_are_dispatched_first() {
        let base = Instant::now();
        // task 1 has waited three windows longer than task 0
        let mut entry = timeline_with(
            &[
                (NORMAL_PRIORITY, Duration::ZERO),
                (NORMAL_PRIORITY, STARVATION_PERIOD * 3),
            ],
            base,
        );

        let slots = slots(1);
        entry.timeline.tick(&slots, base);

        assert_eq!(slots[0].query().pending, Some(TaskId(1)));
    }

    #[test]
    fn priority_breaks_ties_within_the_window() {
        let base = Instant::now();
        let mut entry = timeline_with(
            &[
                (NORMAL_PRIORITY, Duration::from_millis(2)),
                (CRITICAL_PRIORITY, Duration::ZERO),
            ],
            base,
        );

        let slots = slots(1);
        entry.timeline.tick(&slots, base);

        // both are within one starvation window, so the critical task wins
        // even though the normal one is slightly older
        assert_eq!(slots[0].query().pending, Some(TaskId(1)));
    }

    #[test]
    fn starvation_beats_priority_across_windows() {
        let base = Instant::now();
        let mut entry = timeline_with(
            &[
                (CRITICAL_PRIORITY, Duration::ZERO),
                (NORMAL_PRIORITY, STARVATION_PERIOD * 2),
            ],
            base,
        );

        let slots = slots(1);
        entry.timeline.tick(&slots, base);

        // the old normal task is outside the critical task's window, so it
        // is admitted first and the window never has to widen
        assert_eq!(slots[0].query().pending, Some(TaskId(1)));
        // the unselected candidate was asked to yield
        assert_eq!(
            entry.promises[0].fetch_preempt_request(),
            keel::future::PreemptRequest::Preempted
        );
    }

    #[test]
    fn window_widens_when_slots_would_stay_empty() {
        let base = Instant::now();
        let mut entry = timeline_with(
            &[
                (NORMAL_PRIORITY, Duration::ZERO),
                (NORMAL_PRIORITY, STARVATION_PERIOD * 10),
            ],
            base,
        );

        let slots = slots(2);
        entry.timeline.tick(&slots, base);

        // both tasks fit: the second is far outside the base window, but
        // with a free slot remaining the window is widened to cover it
        let staged: Vec<_> = slots.iter().filter_map(|s| s.query().pending).collect();
        assert_eq!(staged.len(), 2);
    }

    #[test]
    fn suspended_tasks_are_excluded_until_resumed() {
        let base = Instant::now();
        let mut entry = timeline_with(&[(NORMAL_PRIORITY, Duration::ZERO)], base);

        // the task honoured a suspend request
        entry.futures[0].request_suspend();
        entry.promises[0].notify_suspended();

        let slots = slots(1);
        entry.timeline.tick(&slots, base);
        assert_eq!(slots[0].query().pending, None);
        assert_eq!(entry.timeline.len(), 1);

        // withdrawing the request makes it compete again in the same tick
        entry.futures[0].request_resume();
        entry.timeline.tick(&slots, base + Duration::from_millis(1));
        assert_eq!(slots[0].query().pending, Some(TaskId(0)));
    }

    #[test]
    fn cancel_all_leaves_executing_tasks_to_resolve_themselves() {
        let base = Instant::now();
        let mut entry = timeline_with(&[(NORMAL_PRIORITY, Duration::ZERO)], base);

        let slots = slots(1);
        entry.timeline.tick(&slots, base);
        assert_eq!(slots[0].query().pending, Some(TaskId(0)));

        // the worker picks the task up and starts running it
        assert!(slots[0].try_pop_task().is_some());
        entry.promises[0].notify_executing();
        entry.timeline.tick(&slots, base + Duration::from_millis(1));

        entry.timeline.cancel_all();
        assert_eq!(
            entry.promises[0].fetch_cancel_request(),
            keel::future::CancelRequest::Canceled
        );
        assert!(!entry.futures[0].is_done());

        // the task honours the request at its next cooperation point
        entry.promises[0].notify_canceled();
        assert_eq!(entry.futures[0].fetch_status(), FutureStatus::Canceled);
    }

    #[test]
    fn cancel_all_resolves_every_task() {
        let base = Instant::now();
        let mut entry = timeline_with(&[(NORMAL_PRIORITY, Duration::ZERO); 4], base);

        entry.timeline.cancel_all();
        for future in &entry.futures {
            assert_eq!(future.fetch_status(), FutureStatus::Canceled);
        }

        entry.timeline.tick(&[], base);
        assert_eq!(entry.timeline.len(), 0);
    }
}
