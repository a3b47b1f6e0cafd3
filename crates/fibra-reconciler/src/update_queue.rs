#![forbid(unsafe_code)]

//! Lane-aware update queues for class components and roots.
//!
//! Each fiber keeps its own `base_updates` list; the two alternates share the
//! `pending` list through [`SharedQueue`]. Processing moves pending updates
//! into the base list of *both* alternates, so an interrupted render never
//! loses an update.
//!
//! # Invariants
//!
//! - Updates whose lane is not in the render lanes are skipped and kept in
//!   the base list together with every update after them, so state is
//!   always a left fold of updates in insertion order.
//! - A rebased update is stored with `Lanes::NONE`; it always applies again
//!   and never fires its callback twice.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Payload closure returns `None` | State unchanged |
//! | Update enqueued during a concurrent render | Held in `interleaved` until the next fresh stack |

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fibra_core::props::PropMap;
use fibra_core::{ComponentError, FiberId, Flags, HostConfig, Lane, Lanes, Timestamp};

use crate::component::{ClassState, ErrorInfo};
use crate::element::{Element, Props};
use crate::fiber::FiberQueue;
use crate::reconciler::Reconciler;

/// State types that live in an [`UpdateQueue`].
pub(crate) trait QueueState: Clone + 'static {
    type Partial: Clone + 'static;

    /// Merge a partial update over `self`.
    fn apply(&self, partial: &Self::Partial) -> Self;

    fn queue_mut(slot: &mut FiberQueue) -> Option<&mut UpdateQueue<Self>>;
}

/// Root state: the element last rendered into the container.
#[derive(Clone, Default)]
pub(crate) struct RootState {
    pub(crate) element: Option<Element>,
}

impl QueueState for RootState {
    type Partial = Option<Element>;

    fn apply(&self, partial: &Option<Element>) -> Self {
        Self {
            element: partial.clone(),
        }
    }

    fn queue_mut(slot: &mut FiberQueue) -> Option<&mut UpdateQueue<Self>> {
        match slot {
            FiberQueue::Root(q) => Some(q),
            _ => None,
        }
    }
}

impl QueueState for ClassState {
    type Partial = PropMap;

    fn apply(&self, partial: &PropMap) -> Self {
        self.merged(partial)
    }

    fn queue_mut(slot: &mut FiberQueue) -> Option<&mut UpdateQueue<Self>> {
        match slot {
            FiberQueue::Class(q) => Some(q),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateTag {
    UpdateState,
    ReplaceState,
    ForceUpdate,
    CaptureUpdate,
}

pub(crate) type ComputeFn<S> = Rc<dyn Fn(&S, &Props) -> Option<<S as QueueState>::Partial>>;

#[derive(Clone)]
pub(crate) enum Payload<S: QueueState> {
    None,
    Partial(S::Partial),
    Compute(ComputeFn<S>),
    Replace(S),
}

/// An error on its way to a boundary.
#[derive(Clone)]
pub(crate) struct CapturedError {
    pub(crate) error: ComponentError,
    pub(crate) info: ErrorInfo,
}

pub(crate) type UserCallback = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

/// Work run in the layout phase once an update commits.
#[derive(Clone)]
pub(crate) enum UpdateCallback {
    User(UserCallback),
    /// Class boundary caught an error.
    DidCatch {
        error: CapturedError,
        without_derived_state: bool,
    },
    /// The root caught an error no boundary handled.
    Uncaught(CapturedError),
}

impl UpdateCallback {
    pub(crate) fn user(f: impl FnOnce() + 'static) -> Self {
        Self::User(Rc::new(RefCell::new(Some(Box::new(f)))))
    }
}

#[derive(Clone)]
pub(crate) struct Update<S: QueueState> {
    pub(crate) lane: Lane,
    pub(crate) tag: UpdateTag,
    pub(crate) payload: Payload<S>,
    pub(crate) callback: Option<UpdateCallback>,
    pub(crate) event_time: Timestamp,
}

impl<S: QueueState> Update<S> {
    pub(crate) fn new(lane: Lane, event_time: Timestamp, payload: Payload<S>) -> Self {
        Self {
            lane,
            tag: UpdateTag::UpdateState,
            payload,
            callback: None,
            event_time,
        }
    }

    #[must_use]
    pub(crate) fn tagged(mut self, tag: UpdateTag) -> Self {
        self.tag = tag;
        self
    }

    #[must_use]
    pub(crate) fn with_callback(mut self, callback: Option<UpdateCallback>) -> Self {
        self.callback = callback;
        self
    }
}

/// Queue side that may receive updates while a concurrent render is running.
pub(crate) trait ConcurrentQueue {
    /// Move interleaved updates onto the pending list.
    fn merge_interleaved(&self);

    /// Lanes of transition updates still pending on this queue.
    fn transition_lanes(&self) -> &Cell<Lanes>;
}

/// Pending list shared by both alternates.
pub(crate) struct SharedQueue<S: QueueState> {
    pending: RefCell<Vec<Update<S>>>,
    interleaved: RefCell<Vec<Update<S>>>,
    lanes: Cell<Lanes>,
}

impl<S: QueueState> Default for SharedQueue<S> {
    fn default() -> Self {
        Self {
            pending: RefCell::new(Vec::new()),
            interleaved: RefCell::new(Vec::new()),
            lanes: Cell::new(Lanes::NONE),
        }
    }
}

impl<S: QueueState> SharedQueue<S> {
    /// Append `update`, holding it aside when `interleaved`.
    pub(crate) fn push(&self, update: Update<S>, interleaved: bool) {
        if interleaved {
            self.interleaved.borrow_mut().push(update);
        } else {
            self.pending.borrow_mut().push(update);
        }
    }

    fn take_pending(&self) -> Vec<Update<S>> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }
}

impl<S: QueueState> ConcurrentQueue for SharedQueue<S> {
    fn merge_interleaved(&self) {
        let moved = std::mem::take(&mut *self.interleaved.borrow_mut());
        self.pending.borrow_mut().extend(moved);
    }

    fn transition_lanes(&self) -> &Cell<Lanes> {
        &self.lanes
    }
}

/// Per-fiber update queue.
#[derive(Clone)]
pub(crate) struct UpdateQueue<S: QueueState> {
    pub(crate) base_state: S,
    pub(crate) base_updates: Vec<Update<S>>,
    pub(crate) shared: Rc<SharedQueue<S>>,
    pub(crate) callbacks: Vec<UpdateCallback>,
}

/// Outcome of [`UpdateQueue::process`].
pub(crate) struct Processed<S> {
    pub(crate) state: S,
    pub(crate) remaining_lanes: Lanes,
    pub(crate) flags: Flags,
    pub(crate) force_update: bool,
}

impl<S: QueueState> UpdateQueue<S> {
    pub(crate) fn new(base_state: S) -> Self {
        Self::with_shared(base_state, Rc::default())
    }

    pub(crate) fn with_shared(base_state: S, shared: Rc<SharedQueue<S>>) -> Self {
        Self {
            base_state,
            base_updates: Vec::new(),
            shared,
            callbacks: Vec::new(),
        }
    }

    /// Fold base updates in `render_lanes` into a new state.
    pub(crate) fn process(&mut self, props: &Props, render_lanes: Lanes) -> Processed<S> {
        let mut state = self.base_state.clone();
        let mut new_base_state: Option<S> = None;
        let mut new_base: Vec<Update<S>> = Vec::new();
        let mut remaining = Lanes::NONE;
        let mut flags = Flags::empty();
        let mut force_update = false;
        self.callbacks.clear();

        for update in std::mem::take(&mut self.base_updates) {
            if !render_lanes.contains(update.lane) {
                if new_base.is_empty() {
                    new_base_state = Some(state.clone());
                }
                remaining |= update.lane;
                new_base.push(update);
                continue;
            }
            if !new_base.is_empty() {
                let mut rebased = update.clone();
                rebased.lane = Lanes::NONE;
                new_base.push(rebased);
            }
            match update.tag {
                UpdateTag::ReplaceState => {
                    state = match &update.payload {
                        Payload::Replace(next) => next.clone(),
                        Payload::Compute(f) => match f(&state, props) {
                            Some(partial) => state.apply(&partial),
                            None => state,
                        },
                        Payload::Partial(partial) => state.apply(partial),
                        Payload::None => state,
                    };
                }
                UpdateTag::UpdateState | UpdateTag::CaptureUpdate => {
                    if update.tag == UpdateTag::CaptureUpdate {
                        flags.remove(Flags::SHOULD_CAPTURE);
                        flags |= Flags::DID_CAPTURE;
                    }
                    state = match &update.payload {
                        Payload::Partial(partial) => state.apply(partial),
                        Payload::Compute(f) => match f(&state, props) {
                            Some(partial) => state.apply(&partial),
                            None => state,
                        },
                        Payload::Replace(next) => next.clone(),
                        Payload::None => state,
                    };
                }
                UpdateTag::ForceUpdate => force_update = true,
            }
            if let Some(callback) = &update.callback
                && !update.lane.is_empty()
            {
                flags |= Flags::CALLBACK;
                self.callbacks.push(callback.clone());
            }
        }

        self.base_state = new_base_state.unwrap_or_else(|| state.clone());
        self.base_updates = new_base;
        tracing::trace!(
            target: "fibra.update_queue",
            render_lanes = %render_lanes,
            remaining = %remaining,
            rebased = self.base_updates.len(),
            "processed update queue"
        );
        Processed {
            state,
            remaining_lanes: remaining,
            flags,
            force_update,
        }
    }
}

impl<H: HostConfig> Reconciler<H> {
    /// Move shared pending updates into the base lists of `wip` and its
    /// alternate, then process the wip queue.
    pub(crate) fn process_update_queue<S: QueueState>(
        &mut self,
        wip: FiberId,
        props: &Props,
        render_lanes: Lanes,
    ) -> Option<Processed<S>> {
        let current = self.fibers[wip].alternate;
        let pending = {
            let queue = S::queue_mut(&mut self.fibers[wip].update_queue)?;
            let pending = queue.shared.take_pending();
            queue.base_updates.extend(pending.iter().cloned());
            pending
        };
        if !pending.is_empty()
            && let Some(cur) = current
            && let Some(cur_queue) = S::queue_mut(&mut self.fibers[cur].update_queue)
        {
            cur_queue.base_updates.extend(pending);
        }
        let queue = S::queue_mut(&mut self.fibers[wip].update_queue)?;
        let processed = queue.process(props, render_lanes);
        let fiber = &mut self.fibers[wip];
        fiber.lanes = processed.remaining_lanes;
        fiber.flags |= processed.flags;
        if processed.flags.contains(Flags::DID_CAPTURE) {
            fiber.flags.remove(Flags::SHOULD_CAPTURE);
        }
        self.session.skipped_lanes |= processed.remaining_lanes;
        Some(processed)
    }

    /// Append an update to a fiber's shared queue.
    pub(crate) fn enqueue_update<S: QueueState>(&mut self, fiber: FiberId, update: Update<S>) -> bool {
        let interleaved = self.shared.is_interleaved(self.fibers[fiber].mode);
        let Some(queue) = S::queue_mut(&mut self.fibers[fiber].update_queue) else {
            return false;
        };
        let shared = queue.shared.clone();
        shared.push(update, interleaved);
        if interleaved {
            self.shared.register_interleaved(shared);
        }
        true
    }

    /// Append a captured update to the wip base list so it is discarded
    /// along with the render if the render is thrown away.
    pub(crate) fn enqueue_captured_update<S: QueueState>(&mut self, wip: FiberId, update: Update<S>) {
        if let Some(queue) = S::queue_mut(&mut self.fibers[wip].update_queue) {
            queue.base_updates.push(update);
        }
    }

    /// Entangle a transition update with the transitions already pending on
    /// the same queue.
    pub(crate) fn entangle_transitions(&mut self, root: fibra_core::RootId, queue: &dyn ConcurrentQueue, lane: Lane) {
        if !lane.is_transition_lane() {
            return;
        }
        let Some(root_ref) = self.roots.get_mut(root) else {
            return;
        };
        let cell = queue.transition_lanes();
        let queue_lanes = cell.get() & root_ref.lanes.pending;
        let next = queue_lanes | lane;
        cell.set(next);
        root_ref.lanes.mark_root_entangled(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibra_core::props::PropValue;

    fn partial(key: &str, value: i64) -> PropMap {
        let mut m = PropMap::new();
        m.insert(key.into(), PropValue::from(value));
        m
    }

    fn merge(lane: Lanes, key: &str, value: i64) -> Update<ClassState> {
        Update::new(lane, 0, Payload::Partial(partial(key, value)))
    }

    fn int(state: &ClassState, key: &str) -> Option<i64> {
        state.get(key).and_then(PropValue::as_int)
    }

    #[test]
    fn skipped_updates_rebase_later_ones() {
        let mut q = UpdateQueue::new(ClassState::default());
        q.base_updates.push(merge(Lanes::DEFAULT, "a", 1));
        q.base_updates.push(merge(Lanes::SYNC, "b", 2));
        let props = Props::default();

        let first = q.process(&props, Lanes::SYNC);
        assert_eq!(int(&first.state, "b"), Some(2));
        assert_eq!(int(&first.state, "a"), None);
        assert_eq!(first.remaining_lanes, Lanes::DEFAULT);
        assert_eq!(q.base_updates.len(), 2);
        assert!(q.base_updates[1].lane.is_empty());

        let second = q.process(&props, Lanes::DEFAULT);
        assert_eq!(int(&second.state, "a"), Some(1));
        assert_eq!(int(&second.state, "b"), Some(2));
        assert!(second.remaining_lanes.is_empty());
        assert!(q.base_updates.is_empty());
    }

    #[test]
    fn rebased_callbacks_fire_once() {
        let mut q = UpdateQueue::new(ClassState::default());
        q.base_updates.push(merge(Lanes::DEFAULT, "a", 1));
        q.base_updates
            .push(merge(Lanes::SYNC, "b", 2).with_callback(Some(UpdateCallback::user(|| {}))));
        let props = Props::default();
        let first = q.process(&props, Lanes::SYNC);
        assert!(first.flags.contains(Flags::CALLBACK));
        assert_eq!(q.callbacks.len(), 1);
        let second = q.process(&props, Lanes::DEFAULT);
        assert!(!second.flags.contains(Flags::CALLBACK));
        assert!(q.callbacks.is_empty());
    }

    #[test]
    fn force_and_capture_are_reported() {
        let mut q = UpdateQueue::new(ClassState::default());
        q.base_updates.push(
            Update::new(Lanes::SYNC, 0, Payload::<ClassState>::None).tagged(UpdateTag::ForceUpdate),
        );
        q.base_updates
            .push(merge(Lanes::SYNC, "err", 1).tagged(UpdateTag::CaptureUpdate));
        let out = q.process(&Props::default(), Lanes::SYNC);
        assert!(out.force_update);
        assert!(out.flags.contains(Flags::DID_CAPTURE));
        assert_eq!(int(&out.state, "err"), Some(1));
    }

    #[test]
    fn compute_payload_sees_previous_state() {
        let mut q = UpdateQueue::new(ClassState::new(partial("n", 1)));
        let bump: ComputeFn<ClassState> =
            Rc::new(|s, _| Some(partial("n", s.get("n").and_then(PropValue::as_int).unwrap_or(0) + 1)));
        q.base_updates.push(Update::new(Lanes::SYNC, 0, Payload::Compute(bump.clone())));
        q.base_updates.push(Update::new(Lanes::SYNC, 0, Payload::Compute(bump)));
        let out = q.process(&Props::default(), Lanes::SYNC);
        assert_eq!(int(&out.state, "n"), Some(3));
    }

    #[test]
    fn interleaved_updates_wait_for_merge() {
        let shared: SharedQueue<ClassState> = SharedQueue::default();
        shared.push(merge(Lanes::DEFAULT, "a", 1), true);
        assert!(shared.take_pending().is_empty());
        shared.merge_interleaved();
        assert_eq!(shared.take_pending().len(), 1);
    }
}
