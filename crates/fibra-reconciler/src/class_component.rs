#![forbid(unsafe_code)]

//! Class component instances and their render-phase lifecycle.
//!
//! A class fiber owns one [`ClassInstance`] shared by both alternates. The
//! instance is constructed on first render with an [`Updater`] bound to the
//! fiber's shared update queue; state changes flow through that queue and
//! are folded by [`UpdateQueue::process`](crate::update_queue::UpdateQueue).
//!
//! # Invariants
//!
//! - `get_derived_state_from_props` runs after the queue is processed and
//!   before `should_component_update`, on every render.
//! - A boundary that captured an error always renders, even when
//!   `should_component_update` would skip it.
//! - A boundary without derived error state renders nothing for the
//!   captured pass and is remembered as failed until the root has no
//!   pending work left.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use fibra_core::props::{shallow_equal, PropMap};
use fibra_core::{FiberId, Flags, HostConfig, Lane, Lanes, Mode};

use crate::component::{ClassComponent, ClassDef, ClassState};
use crate::element::{Element, Props};
use crate::fiber::{FiberQueue, MemoState, StateNode};
use crate::reconciler::Reconciler;
use crate::shared::{InboxEntry, Shared};
use crate::throw::{call_user, WorkError};
use crate::update_queue::{Payload, SharedQueue, Update, UpdateCallback, UpdateQueue, UpdateTag};

/// Live instance of a class component.
pub(crate) struct ClassInstance {
    pub(crate) component: Box<dyn ClassComponent>,
    pub(crate) props: Props,
    pub(crate) state: ClassState,
    /// Value returned by `get_snapshot_before_update` for the pending commit.
    pub(crate) snapshot: Option<Rc<dyn std::any::Any>>,
    /// Set when the captured error produced no derived state.
    pub(crate) capture_renders_nothing: bool,
    pub(crate) failed: bool,
}

/// Handle a class instance uses to schedule its own updates.
#[derive(Clone)]
pub struct Updater {
    shared: Weak<Shared>,
    queue: Rc<SharedQueue<ClassState>>,
    fiber: FiberId,
    mode: Mode,
}

impl Updater {
    /// Shallow-merge `partial` into the state.
    pub fn set_state(&self, partial: PropMap) {
        self.enqueue(UpdateTag::UpdateState, Payload::Partial(partial), None);
    }

    /// Like [`Updater::set_state`], running `callback` once the update commits.
    pub fn set_state_then(&self, partial: PropMap, callback: impl FnOnce() + 'static) {
        self.enqueue(
            UpdateTag::UpdateState,
            Payload::Partial(partial),
            Some(UpdateCallback::user(callback)),
        );
    }

    /// Compute a partial from the latest state and props; `None` skips.
    pub fn set_state_with(&self, f: impl Fn(&ClassState, &Props) -> Option<PropMap> + 'static) {
        self.enqueue(UpdateTag::UpdateState, Payload::Compute(Rc::new(f)), None);
    }

    /// Replace the state wholesale.
    pub fn replace_state(&self, state: PropMap) {
        self.enqueue(
            UpdateTag::ReplaceState,
            Payload::Replace(ClassState::new(state)),
            None,
        );
    }

    /// Re-render, skipping `should_component_update`.
    pub fn force_update(&self) {
        self.enqueue(UpdateTag::ForceUpdate, Payload::None, None);
    }

    pub fn force_update_then(&self, callback: impl FnOnce() + 'static) {
        self.enqueue(
            UpdateTag::ForceUpdate,
            Payload::None,
            Some(UpdateCallback::user(callback)),
        );
    }

    fn enqueue(&self, tag: UpdateTag, payload: Payload<ClassState>, callback: Option<UpdateCallback>) {
        let Some(shared) = self.shared.upgrade() else {
            tracing::debug!(target: "fibra.update_queue", "dropping class update after the reconciler was dropped");
            return;
        };
        let lane = shared.request_update_lane(self.mode);
        let event_time = shared.now();
        let update = Update::new(lane, event_time, payload)
            .tagged(tag)
            .with_callback(callback);
        let interleaved = shared.is_interleaved(self.mode);
        self.queue.push(update, interleaved);
        if interleaved {
            shared.register_interleaved(self.queue.clone());
        }
        tracing::trace!(target: "fibra.update_queue", lane = %lane, tag = ?tag, "class update enqueued");
        shared.post(InboxEntry::Update {
            fiber: self.fiber,
            lane,
            event_time,
            queue: self.queue.clone(),
            eager: None,
        });
    }
}

fn class_instance(state_node: &StateNode) -> Option<Rc<RefCell<ClassInstance>>> {
    match state_node {
        StateNode::Class(inst) => Some(inst.clone()),
        _ => None,
    }
}

fn class_state(state: &MemoState) -> ClassState {
    match state {
        MemoState::Class(s) => s.clone(),
        _ => ClassState::default(),
    }
}

impl<H: HostConfig> Reconciler<H> {
    /// Begin a class fiber: construct, resume or update it, then render.
    pub(crate) fn update_class_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        def: &Rc<ClassDef>,
        render_lanes: Lanes,
    ) -> Result<Option<FiberId>, WorkError> {
        let props = self.fibers[wip].pending_props.clone();
        let instance = class_instance(&self.fibers[wip].state_node);
        let should_update = match (instance, current) {
            (None, _) => {
                self.mount_class_instance(wip, def, &props, render_lanes)?;
                true
            }
            (Some(inst), None) => self.resume_class_instance(wip, &inst, &props, render_lanes)?,
            (Some(inst), Some(cur)) => self.update_class_instance(cur, wip, &inst, &props, render_lanes)?,
        };
        self.finish_class_component(current, wip, should_update, render_lanes)
    }

    fn mount_class_instance(
        &mut self,
        wip: FiberId,
        def: &Rc<ClassDef>,
        props: &Props,
        render_lanes: Lanes,
    ) -> Result<(), WorkError> {
        let mode = self.fibers[wip].mode;
        let queue: Rc<SharedQueue<ClassState>> = Rc::default();
        let updater = Updater {
            shared: Rc::downgrade(&self.shared),
            queue: queue.clone(),
            fiber: wip,
            mode,
        };
        let (component, initial) = call_user(|| Ok((def.construct(props, updater), def.initial_state(props))))?;
        {
            let f = &mut self.fibers[wip];
            f.update_queue = FiberQueue::Class(UpdateQueue::with_shared(initial.clone(), queue));
            f.memoized_state = MemoState::Class(initial.clone());
        }
        let mut state = self
            .process_update_queue::<ClassState>(wip, props, render_lanes)
            .map_or(initial, |p| p.state);
        if let Some(partial) = call_user(|| Ok(component.get_derived_state_from_props(props, &state)))? {
            state = state.merged(&partial);
            self.set_base_state_if_idle(wip, &state);
        }
        let f = &mut self.fibers[wip];
        f.memoized_state = MemoState::Class(state.clone());
        f.flags |= Flags::UPDATE | Flags::LAYOUT_STATIC;
        f.state_node = StateNode::Class(Rc::new(RefCell::new(ClassInstance {
            component,
            props: props.clone(),
            state,
            snapshot: None,
            capture_renders_nothing: false,
            failed: false,
        })));
        tracing::trace!(target: "fibra.begin", component = def.name(), "class instance constructed");
        Ok(())
    }

    /// Instance survived a render that never committed; treat like a mount
    /// that keeps its instance.
    fn resume_class_instance(
        &mut self,
        wip: FiberId,
        inst: &Rc<RefCell<ClassInstance>>,
        props: &Props,
        render_lanes: Lanes,
    ) -> Result<bool, WorkError> {
        let mut state = self
            .process_update_queue::<ClassState>(wip, props, render_lanes)
            .map_or_else(|| class_state(&self.fibers[wip].memoized_state), |p| p.state);
        let derived = {
            let borrowed = inst.borrow();
            call_user(|| Ok(borrowed.component.get_derived_state_from_props(props, &state)))?
        };
        if let Some(partial) = derived {
            state = state.merged(&partial);
            self.set_base_state_if_idle(wip, &state);
        }
        let f = &mut self.fibers[wip];
        f.memoized_state = MemoState::Class(state.clone());
        f.flags |= Flags::UPDATE | Flags::LAYOUT_STATIC;
        let mut i = inst.borrow_mut();
        i.props = props.clone();
        i.state = state;
        Ok(true)
    }

    fn update_class_instance(
        &mut self,
        current: FiberId,
        wip: FiberId,
        inst: &Rc<RefCell<ClassInstance>>,
        props: &Props,
        render_lanes: Lanes,
    ) -> Result<bool, WorkError> {
        let old_props = self.fibers[current].memoized_props.clone().unwrap_or_default();
        let old_state = class_state(&self.fibers[wip].memoized_state);
        let processed = self.process_update_queue::<ClassState>(wip, props, render_lanes);
        let (mut new_state, force) = match processed {
            Some(p) => (p.state, p.force_update),
            None => (old_state.clone(), false),
        };

        if old_props.ptr_eq(props) && old_state.ptr_eq(&new_state) && !force {
            return Ok(false);
        }

        let derived = {
            let borrowed = inst.borrow();
            call_user(|| Ok(borrowed.component.get_derived_state_from_props(props, &new_state)))?
        };
        if let Some(partial) = derived {
            new_state = new_state.merged(&partial);
            self.set_base_state_if_idle(wip, &new_state);
        }

        let should_update = force || {
            let borrowed = inst.borrow();
            if borrowed.component.is_pure() {
                !(shallow_equal(old_props.attrs(), props.attrs())
                    && old_props.same_children(props)
                    && shallow_equal(old_state.as_map(), new_state.as_map()))
            } else {
                call_user(|| Ok(borrowed.component.should_component_update(props, &new_state)))?
            }
        };

        let f = &mut self.fibers[wip];
        if should_update {
            f.flags |= Flags::UPDATE | Flags::SNAPSHOT;
        } else {
            // Skipped renders still remember the latest inputs.
            f.memoized_props = Some(props.clone());
        }
        f.memoized_state = MemoState::Class(new_state.clone());
        let mut i = inst.borrow_mut();
        i.props = props.clone();
        i.state = new_state;
        Ok(should_update)
    }

    fn set_base_state_if_idle(&mut self, wip: FiberId, state: &ClassState) {
        let f = &mut self.fibers[wip];
        if f.lanes.is_empty()
            && let FiberQueue::Class(queue) = &mut f.update_queue
        {
            queue.base_state = state.clone();
        }
    }

    fn finish_class_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        should_update: bool,
        render_lanes: Lanes,
    ) -> Result<Option<FiberId>, WorkError> {
        let did_capture = self.fibers[wip].flags.contains(Flags::DID_CAPTURE);
        if !should_update && !did_capture {
            return Ok(self.bailout_on_already_finished_work(current, wip, render_lanes));
        }
        let Some(inst) = class_instance(&self.fibers[wip].state_node) else {
            return Ok(None);
        };

        let render_nothing = did_capture && inst.borrow().capture_renders_nothing;
        let children = if render_nothing {
            Element::empty()
        } else {
            let borrowed = inst.borrow();
            let (props, state) = (borrowed.props.clone(), borrowed.state.clone());
            call_user(|| borrowed.component.render(&props, &state))?
        };
        self.fibers[wip].flags |= Flags::PERFORMED_WORK;

        if did_capture && let Some(cur) = current {
            // Remount from scratch so the failed subtree is not reused.
            let old_first = self.fibers[cur].child;
            self.reconcile_child_fibers(wip, old_first, &[], render_lanes, true);
            let child = self.reconcile_child_fibers(wip, None, std::slice::from_ref(&children), render_lanes, true);
            self.fibers[wip].child = child;
        } else {
            self.reconcile_children(current, wip, std::slice::from_ref(&children), render_lanes);
        }
        self.fibers[wip].memoized_state = MemoState::Class(inst.borrow().state.clone());
        Ok(self.fibers[wip].child)
    }

    /// Enqueue a force update on a class fiber, bypassing the inbox.
    ///
    /// Used while rendering, when a provider above the class changed.
    pub(crate) fn force_class_update(&mut self, fiber: FiberId, lane: Lane) {
        let update = Update::<ClassState>::new(lane, self.shared.now(), Payload::None).tagged(UpdateTag::ForceUpdate);
        if !self.enqueue_update(fiber, update) {
            tracing::debug!(target: "fibra.begin", "class fiber has no update queue yet");
        }
    }
}
