#![forbid(unsafe_code)]

//! State shared between the reconciler and the handles it gives out.
//!
//! State setters, class updaters and suspense listeners outlive any single
//! borrow of the reconciler, so they cannot call into it directly. They talk
//! to [`Shared`] instead: request a lane, append to a queue, and push an
//! [`InboxEntry`]. The reconciler drains the inbox before it does anything
//! else, which keeps every arena mutation on the `&mut Reconciler` path.
//!
//! When nothing is running, the first inbox entry also asks the scheduler for
//! a [`Task::ProcessUpdates`] callback so outside dispatches are never lost.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;
use fibra_core::lane::LaneAllocator;
use fibra_core::{
    EventPriority, FiberId, Lane, Lanes, Mode, RootId, Scheduler, SchedulerPriority, Task,
    Timestamp,
};

use crate::hooks::{HookQueue, HookUpdate};
use crate::update_queue::ConcurrentQueue;

bitflags! {
    /// What the reconciler is currently doing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ExecutionContext: u8 {
        const BATCHED = 1 << 0;
        const RENDER = 1 << 1;
        const COMMIT = 1 << 2;
    }
}

/// State hook update that may bail out before scheduling.
pub(crate) struct EagerCandidate {
    pub(crate) queue: Rc<HookQueue>,
    pub(crate) update: Rc<HookUpdate>,
}

/// Work posted by handles for the reconciler to apply.
pub(crate) enum InboxEntry {
    Update {
        fiber: FiberId,
        lane: Lane,
        event_time: Timestamp,
        queue: Rc<dyn ConcurrentQueue>,
        eager: Option<EagerCandidate>,
    },
    /// An external store changed; re-render synchronously.
    ForceSync { fiber: FiberId },
    /// A wakeable a suspended render waited on settled.
    Ping {
        root: RootId,
        wakeable: u64,
        lanes: Lanes,
    },
    /// A wakeable a committed boundary waits on settled.
    Retry { boundary: FiberId, wakeable: u64 },
}

/// Reconciler state reachable from handles.
pub(crate) struct Shared {
    pub(crate) scheduler: Rc<dyn Scheduler>,
    execution: Cell<ExecutionContext>,
    update_priority: Cell<Option<EventPriority>>,
    event_priority: Cell<EventPriority>,
    in_transition: Cell<bool>,
    event_transition_lane: Cell<Lanes>,
    pub(crate) lanes: LaneAllocator,
    /// Lanes of the render in progress, if any.
    render_lanes: Cell<Lanes>,
    /// Fiber (and its alternate) whose render function is running.
    rendering: Cell<Option<(FiberId, Option<FiberId>)>>,
    render_phase_update: Cell<bool>,
    inbox: RefCell<VecDeque<InboxEntry>>,
    interleaved: RefCell<Vec<Rc<dyn ConcurrentQueue>>>,
    process_scheduled: Cell<bool>,
}

impl Shared {
    pub(crate) fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            execution: Cell::new(ExecutionContext::empty()),
            update_priority: Cell::new(None),
            event_priority: Cell::new(EventPriority::Default),
            in_transition: Cell::new(false),
            event_transition_lane: Cell::new(Lanes::NONE),
            lanes: LaneAllocator::new(),
            render_lanes: Cell::new(Lanes::NONE),
            rendering: Cell::new(None),
            render_phase_update: Cell::new(false),
            inbox: RefCell::new(VecDeque::new()),
            interleaved: RefCell::new(Vec::new()),
            process_scheduled: Cell::new(false),
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.scheduler.now()
    }

    // -- execution context --------------------------------------------------

    pub(crate) fn execution(&self) -> ExecutionContext {
        self.execution.get()
    }

    pub(crate) fn set_execution(&self, ctx: ExecutionContext) {
        self.execution.set(ctx);
    }

    /// Add `flag` and return the previous context.
    pub(crate) fn enter(&self, flag: ExecutionContext) -> ExecutionContext {
        let prev = self.execution.get();
        self.execution.set(prev | flag);
        prev
    }

    pub(crate) fn is_working(&self) -> bool {
        self.execution
            .get()
            .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT)
    }

    // -- priorities ---------------------------------------------------------

    pub(crate) fn update_priority(&self) -> Option<EventPriority> {
        self.update_priority.get()
    }

    pub(crate) fn set_update_priority(&self, priority: Option<EventPriority>) {
        self.update_priority.set(priority);
    }

    pub(crate) fn set_event_priority(&self, priority: EventPriority) -> EventPriority {
        self.event_priority.replace(priority)
    }

    pub(crate) fn in_transition(&self) -> bool {
        self.in_transition.get()
    }

    pub(crate) fn set_in_transition(&self, value: bool) -> bool {
        self.in_transition.replace(value)
    }

    /// Forget the transition lane claimed for the current event.
    pub(crate) fn reset_event_transition_lane(&self) {
        self.event_transition_lane.set(Lanes::NONE);
    }

    /// Lane for an update on a fiber in `mode`.
    pub(crate) fn request_update_lane(&self, mode: Mode) -> Lane {
        if !mode.contains(Mode::CONCURRENT) {
            return Lanes::SYNC;
        }
        let render_lanes = self.render_lanes.get();
        if self.execution.get().contains(ExecutionContext::RENDER) && !render_lanes.is_empty() {
            return render_lanes.highest_priority_lane();
        }
        if self.in_transition.get() {
            if self.event_transition_lane.get().is_empty() {
                self.event_transition_lane
                    .set(self.lanes.claim_next_transition_lane());
            }
            return self.event_transition_lane.get();
        }
        if let Some(priority) = self.update_priority.get() {
            return priority.lane();
        }
        self.event_priority.get().lane()
    }

    /// True if an update on a fiber in `mode` must wait for the next fresh stack.
    pub(crate) fn is_interleaved(&self, mode: Mode) -> bool {
        mode.contains(Mode::CONCURRENT)
            && !self.render_lanes.get().is_empty()
            && !self.execution.get().contains(ExecutionContext::RENDER)
    }

    pub(crate) fn register_interleaved(&self, queue: Rc<dyn ConcurrentQueue>) {
        self.interleaved.borrow_mut().push(queue);
    }

    /// Move every interleaved update onto its pending list.
    pub(crate) fn finish_interleaved(&self) -> usize {
        let queues = std::mem::take(&mut *self.interleaved.borrow_mut());
        for q in &queues {
            q.merge_interleaved();
        }
        queues.len()
    }

    // -- render tracking ----------------------------------------------------

    pub(crate) fn set_render_lanes(&self, lanes: Lanes) {
        self.render_lanes.set(lanes);
    }

    pub(crate) fn begin_component_render(&self, fiber: FiberId, alternate: Option<FiberId>) {
        self.rendering.set(Some((fiber, alternate)));
        self.render_phase_update.set(false);
    }

    pub(crate) fn end_component_render(&self) {
        self.rendering.set(None);
    }

    /// True if `fiber` is the component currently rendering.
    pub(crate) fn is_rendering(&self, fiber: FiberId) -> bool {
        self.rendering
            .get()
            .is_some_and(|(wip, alt)| wip == fiber || alt == Some(fiber))
    }

    pub(crate) fn mark_render_phase_update(&self) {
        self.render_phase_update.set(true);
    }

    pub(crate) fn take_render_phase_update(&self) -> bool {
        self.render_phase_update.replace(false)
    }

    // -- inbox --------------------------------------------------------------

    pub(crate) fn post(&self, entry: InboxEntry) {
        self.inbox.borrow_mut().push_back(entry);
        if self.execution.get().is_empty() && !self.process_scheduled.replace(true) {
            self.scheduler
                .schedule_callback(SchedulerPriority::Immediate, Task::ProcessUpdates, None);
        }
    }

    pub(crate) fn next_entry(&self) -> Option<InboxEntry> {
        self.inbox.borrow_mut().pop_front()
    }

    pub(crate) fn has_entries(&self) -> bool {
        !self.inbox.borrow().is_empty()
    }

    pub(crate) fn clear_process_scheduled(&self) {
        self.process_scheduled.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibra_core::CallbackHandle;

    #[derive(Default)]
    struct CountingScheduler {
        scheduled: Cell<u64>,
    }

    impl Scheduler for CountingScheduler {
        fn schedule_callback(&self, _: SchedulerPriority, _: Task, _: Option<Timestamp>) -> CallbackHandle {
            self.scheduled.set(self.scheduled.get() + 1);
            CallbackHandle::from_raw(self.scheduled.get())
        }
        fn cancel_callback(&self, _: CallbackHandle) {}
        fn should_yield(&self) -> bool {
            false
        }
        fn now(&self) -> Timestamp {
            0
        }
    }

    fn shared() -> (Rc<CountingScheduler>, Shared) {
        let sched = Rc::new(CountingScheduler::default());
        let shared = Shared::new(sched.clone());
        (sched, shared)
    }

    #[test]
    fn legacy_mode_is_always_sync() {
        let (_, s) = shared();
        s.set_in_transition(true);
        assert_eq!(s.request_update_lane(Mode::empty()), Lanes::SYNC);
    }

    #[test]
    fn transition_lane_is_stable_within_an_event() {
        let (_, s) = shared();
        s.set_in_transition(true);
        let a = s.request_update_lane(Mode::CONCURRENT);
        let b = s.request_update_lane(Mode::CONCURRENT);
        assert!(a.is_transition_lane());
        assert_eq!(a, b);
        s.reset_event_transition_lane();
        let c = s.request_update_lane(Mode::CONCURRENT);
        assert_ne!(a, c);
    }

    #[test]
    fn update_priority_beats_event_priority() {
        let (_, s) = shared();
        assert_eq!(s.request_update_lane(Mode::CONCURRENT), Lanes::DEFAULT);
        s.set_update_priority(Some(EventPriority::Discrete));
        assert_eq!(s.request_update_lane(Mode::CONCURRENT), Lanes::SYNC);
    }

    #[test]
    fn posting_schedules_processing_once() {
        let (sched, s) = shared();
        s.post(InboxEntry::ForceSync {
            fiber: FiberId::default(),
        });
        s.post(InboxEntry::ForceSync {
            fiber: FiberId::default(),
        });
        assert_eq!(sched.scheduled.get(), 1);
        assert!(s.next_entry().is_some());
        assert!(s.next_entry().is_some());
        assert!(!s.has_entries());
    }

    #[test]
    fn nothing_is_scheduled_while_working() {
        let (sched, s) = shared();
        s.enter(ExecutionContext::RENDER);
        s.post(InboxEntry::ForceSync {
            fiber: FiberId::default(),
        });
        assert_eq!(sched.scheduled.get(), 0);
    }
}
