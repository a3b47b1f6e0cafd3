#![forbid(unsafe_code)]

//! Commit: apply a finished tree to the host and run lifecycle effects.
//!
//! A commit runs in three passes over the finished tree, each pruned by
//! `subtree_flags`:
//!
//! 1. **Before mutation**: class snapshots; the root clears its container
//!    on first mount.
//! 2. **Mutation**: deletions (with unmount lifecycles and ref detach),
//!    placements, host updates, visibility toggles. The finished tree then
//!    becomes current.
//! 3. **Layout**: layout effects, class mount/update lifecycles, update
//!    callbacks, ref attach, profiler reports.
//!
//! Passive effects are left for [`Reconciler::flush_passive_effects_impl`].
//!
//! # Invariants
//!
//! - Host mutation happens only between `prepare_for_commit` and
//!   `reset_after_commit`.
//! - A fiber is placed before the sibling it is inserted before is looked
//!   up; siblings still flagged for placement are never used as anchors.
//! - Errors thrown by lifecycle code are routed to the nearest boundary as
//!   a sync update; the commit itself always finishes.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Lifecycle or effect throws | Captured, boundary re-renders on the sync lane |
//! | No boundary above the error | Root renders nothing, observer notified |
//! | Placed fiber has no host parent | Placement skipped, `error` event |

use std::cell::RefCell;
use std::rc::Rc;

use web_time::Instant;

use fibra_core::{
    ComponentError, EventPriority, FiberId, Flags, HookFlags, HostConfig, HostNode, HostNodeId, Lanes,
    ReconcilerError, RootId, SchedulerPriority, Task,
};

use crate::class_component::ClassInstance;
use crate::component::{ClassState, ProfilerPhase, ProfilerReport};
use crate::fiber::{FiberKind, FiberQueue, MemoState, StateNode};
use crate::passive::PendingPassive;
use crate::reconciler::Reconciler;
use crate::shared::ExecutionContext;
use crate::throw::call_user_commit;
use crate::update_queue::{CapturedError, UpdateCallback};

/// Where placed host nodes go.
enum HostParent<C> {
    Node(HostNodeId),
    Container(C),
}

impl<H: HostConfig> Reconciler<H> {
    /// Commit the finished work staged on `root`.
    pub(crate) fn commit_root(&mut self, root: RootId) -> Result<(), ReconcilerError> {
        while self.flush_passive_effects_impl()? {}

        let r = self.roots.get_mut(root).ok_or(ReconcilerError::UnknownRoot)?;
        let Some(finished) = r.finished_work.take() else {
            return Ok(());
        };
        let lanes = std::mem::replace(&mut r.finished_lanes, Lanes::NONE);
        let recoverable = std::mem::take(&mut r.recoverable_errors);
        let stale_callback = r.callback_node.take();
        r.callback_priority = Lanes::NONE;
        let timeout = r.timeout_handle.take();
        let remaining = self.fibers[finished].lanes | self.fibers[finished].child_lanes;
        r.lanes.mark_root_finished(remaining);
        let is_concurrent = r.is_concurrent();
        let container = r.container.clone();
        for handle in stale_callback.into_iter().chain(timeout) {
            self.shared.scheduler.cancel_callback(handle);
        }
        if self.session.root == Some(root) {
            self.reset_session();
        }
        let span = tracing::debug_span!(
            "fibra.commit",
            root = ?root,
            lanes = %lanes,
            duration_us = tracing::field::Empty
        );
        let _guard = span.enter();
        let started = Instant::now();
        tracing::debug!(target: "fibra.commit", remaining = %remaining, "committing root");

        let all_flags = self.fibers[finished].flags | self.fibers[finished].subtree_flags;
        let has_passive = all_flags.intersects(Flags::PASSIVE_MASK);
        if has_passive && !self.passive_scheduled {
            self.passive_scheduled = true;
            self.shared
                .scheduler
                .schedule_callback(SchedulerPriority::Normal, Task::FlushPassiveEffects, None);
        }

        let has_effects = all_flags
            .intersects(Flags::BEFORE_MUTATION_MASK | Flags::MUTATION_MASK | Flags::LAYOUT_MASK);
        if has_effects {
            let prev_priority = self.shared.update_priority();
            self.shared.set_update_priority(Some(EventPriority::Discrete));
            let prev_execution = self.shared.enter(ExecutionContext::COMMIT);

            self.host.prepare_for_commit(&container);
            self.commit_before_mutation_effects(finished, &container);
            self.commit_mutation_effects(finished);
            self.host.reset_after_commit(&container);
            self.roots[root].current = finished;
            self.commit_layout_effects(finished);
            self.shared.scheduler.request_paint();

            self.shared.set_execution(prev_execution);
            self.shared.set_update_priority(prev_priority);
        } else {
            self.roots[root].current = finished;
        }

        if has_passive {
            self.pending_passive = Some(PendingPassive { root, finished, lanes });
        }

        let pending = self.roots[root].lanes.pending;
        if pending.is_empty() {
            for inst in self.failed_boundaries.drain(..) {
                inst.borrow_mut().failed = false;
            }
        }

        span.record("duration_us", u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX));

        self.drain_inbox()?;
        let pending = self.roots.get(root).map_or(Lanes::NONE, |r| r.lanes.pending);
        if pending.includes_sync_lane() {
            if self.root_with_nested_updates == Some(root) {
                self.nested_update_count += 1;
            } else {
                self.nested_update_count = 0;
                self.root_with_nested_updates = Some(root);
            }
        } else {
            self.nested_update_count = 0;
        }

        self.ensure_root_is_scheduled(root);
        self.observer.on_commit(root, lanes);
        for captured in recoverable {
            tracing::warn!(
                target: "fibra.commit",
                error = %captured.error,
                "recovered from an error by re-rendering synchronously"
            );
            self.observer.on_recoverable_error(&captured.error, &captured.info);
        }

        if has_passive && lanes.includes_sync_lane() && is_concurrent {
            self.flush_passive_effects_impl()?;
        }
        self.flush_sync_callbacks()
    }

    /// Report an error no boundary caught.
    pub(crate) fn report_uncaught_error(&mut self, captured: &CapturedError) {
        if self.observer.on_uncaught_error(&captured.error, &captured.info) {
            tracing::error!(
                target: "fibra.commit",
                error = %captured.error,
                stack = %captured.info.component_stack,
                "uncaught error; the root renders nothing"
            );
        }
    }

    // -- helpers ------------------------------------------------------------

    fn capture_user_error(&mut self, fiber: FiberId, error: ComponentError) {
        let nearest = self.fibers.get(fiber).and_then(|f| f.return_);
        self.capture_commit_phase_error(fiber, nearest, error);
    }

    fn effects_of(&self, fiber: FiberId) -> Vec<Rc<crate::hooks::Effect>> {
        match &self.fibers[fiber].update_queue {
            FiberQueue::Function(queue) => queue.effects.clone(),
            _ => Vec::new(),
        }
    }

    /// Run the destroy of every effect of `fiber` whose tag contains `tag`.
    pub(crate) fn commit_hook_unmounts(&mut self, fiber: FiberId, tag: HookFlags, nearest: Option<FiberId>) {
        for effect in self.effects_of(fiber) {
            if !effect.tag.contains(tag) {
                continue;
            }
            let destroy = effect.inst.destroy.borrow_mut().take();
            if let Some(destroy) = destroy
                && let Err(error) = call_user_commit(|| {
                    destroy();
                    Ok(())
                })
            {
                self.capture_commit_phase_error(fiber, nearest, error);
            }
        }
    }

    /// Run the create of every effect of `fiber` whose tag contains `tag`.
    pub(crate) fn commit_hook_mounts(&mut self, fiber: FiberId, tag: HookFlags) {
        for effect in self.effects_of(fiber) {
            if !effect.tag.contains(tag) {
                continue;
            }
            let create = effect.create.borrow_mut().take();
            let Some(create) = create else { continue };
            match call_user_commit(|| Ok(create())) {
                Ok(cleanup) => *effect.inst.destroy.borrow_mut() = cleanup.into_inner(),
                Err(error) => self.capture_user_error(fiber, error),
            }
        }
    }

    fn class_instance(&self, fiber: FiberId) -> Option<Rc<RefCell<ClassInstance>>> {
        match &self.fibers[fiber].state_node {
            StateNode::Class(inst) => Some(inst.clone()),
            _ => None,
        }
    }

    /// Children of `fiber` whose subtree carries any of `mask`.
    fn children_with(&self, fiber: FiberId, mask: Flags) -> Vec<FiberId> {
        if !self.fibers[fiber].subtree_flags.intersects(mask) {
            return Vec::new();
        }
        self.children_of(fiber)
    }

    // -- before mutation ----------------------------------------------------

    fn commit_before_mutation_effects(&mut self, fiber: FiberId, container: &H::Container) {
        for child in self.children_with(fiber, Flags::BEFORE_MUTATION_MASK) {
            self.commit_before_mutation_effects(child, container);
        }
        if !self.fibers[fiber].flags.contains(Flags::SNAPSHOT) {
            return;
        }
        match self.fibers[fiber].kind {
            FiberKind::Class(_) => {
                let Some(cur) = self.fibers[fiber].alternate else { return };
                let Some(inst) = self.class_instance(fiber) else { return };
                let prev_props = self.fibers[cur].memoized_props.clone().unwrap_or_default();
                let prev_state = match &self.fibers[cur].memoized_state {
                    MemoState::Class(s) => s.clone(),
                    _ => ClassState::default(),
                };
                let result = call_user_commit(|| {
                    inst.borrow_mut()
                        .component
                        .get_snapshot_before_update(&prev_props, &prev_state)
                });
                match result {
                    Ok(snapshot) => inst.borrow_mut().snapshot = snapshot,
                    Err(error) => self.capture_user_error(fiber, error),
                }
            }
            FiberKind::HostRoot => self.host.clear_container(container),
            _ => {}
        }
    }

    // -- mutation -----------------------------------------------------------

    fn commit_mutation_effects(&mut self, fiber: FiberId) {
        let deletions = self.fibers[fiber].deletions.clone();
        for deleted in deletions {
            self.commit_deletion(fiber, deleted);
        }
        for child in self.children_with(fiber, Flags::MUTATION_MASK) {
            self.commit_mutation_effects(child);
        }

        let flags = self.fibers[fiber].flags;
        if flags.contains(Flags::PLACEMENT) {
            self.commit_placement(fiber);
            self.fibers[fiber].flags.remove(Flags::PLACEMENT);
        }
        let current = self.fibers[fiber].alternate;

        match self.fibers[fiber].kind.clone() {
            FiberKind::Function(_) | FiberKind::Memo(_) | FiberKind::Lazy(_) => {
                if flags.contains(Flags::UPDATE) {
                    let nearest = self.fibers[fiber].return_;
                    self.commit_hook_unmounts(fiber, HookFlags::INSERTION | HookFlags::HAS_EFFECT, nearest);
                    self.commit_hook_mounts(fiber, HookFlags::INSERTION | HookFlags::HAS_EFFECT);
                    self.commit_hook_unmounts(fiber, HookFlags::LAYOUT | HookFlags::HAS_EFFECT, nearest);
                }
            }
            FiberKind::HostComponent(ty) => {
                if flags.contains(Flags::REF)
                    && let Some(cur) = current
                    && let Some(old) = &self.fibers[cur].ref_
                {
                    old.set(None);
                }
                let Some(node) = self.fibers[fiber].state_node.host() else { return };
                if flags.contains(Flags::CONTENT_RESET)
                    && let Some(inst) = self.host_nodes.get(node).and_then(HostNode::as_instance)
                {
                    self.host.reset_text_content(inst);
                }
                if flags.contains(Flags::UPDATE)
                    && let Some(cur) = current
                    && let Some(payload) = self.host_payloads.remove(fiber)
                {
                    let old = self.fibers[cur].memoized_props.clone().unwrap_or_default();
                    let new = self.fibers[fiber].memoized_props.clone().unwrap_or_default();
                    if let Some(inst) = self.host_nodes.get(node).and_then(HostNode::as_instance) {
                        self.host.commit_update(inst, payload, &ty, old.attrs(), new.attrs());
                    }
                }
            }
            FiberKind::HostText => {
                if flags.contains(Flags::UPDATE)
                    && let Some(cur) = current
                    && let Some(node) = self.fibers[fiber].state_node.host()
                {
                    let old = self.fibers[cur].memoized_props.clone().unwrap_or_default();
                    let new = self.fibers[fiber].memoized_props.clone().unwrap_or_default();
                    if let Some(text) = self.host_nodes.get(node).and_then(HostNode::as_text) {
                        self.host
                            .commit_text_update(text, old.text().unwrap_or_default(), new.text().unwrap_or_default());
                    }
                }
            }
            FiberKind::Offscreen => {
                if flags.contains(Flags::VISIBILITY) {
                    let hidden = matches!(self.fibers[fiber].memoized_state, MemoState::Offscreen(_));
                    self.hide_or_unhide_all_children(fiber, hidden);
                }
            }
            FiberKind::Suspense | FiberKind::SuspenseList(_) => {
                let showing_fallback = matches!(self.fibers[fiber].memoized_state, MemoState::SuspenseFallback);
                let was_showing = current.is_some_and(|c| {
                    matches!(self.fibers[c].memoized_state, MemoState::SuspenseFallback)
                });
                if showing_fallback && !was_showing {
                    self.most_recent_fallback_time = self.shared.now();
                }
                if flags.contains(Flags::UPDATE) {
                    self.attach_suspense_retry_listeners(fiber);
                }
            }
            _ => {}
        }
    }

    fn host_parent_from(&self, start: Option<FiberId>) -> Option<HostParent<H::Container>> {
        let mut node = start;
        while let Some(id) = node {
            let f = &self.fibers[id];
            match &f.kind {
                FiberKind::HostComponent(_) => return f.state_node.host().map(HostParent::Node),
                FiberKind::HostRoot => {
                    let StateNode::Root(root) = f.state_node else { return None };
                    return self.roots.get(root).map(|r| HostParent::Container(r.container.clone()));
                }
                FiberKind::HostPortal(portal) => {
                    return self.portals.get(*portal).cloned().map(HostParent::Container);
                }
                _ => node = f.return_,
            }
        }
        None
    }

    /// Next host node after `fiber` that is already in place.
    fn host_sibling(&mut self, fiber: FiberId) -> Option<HostNodeId> {
        let mut node = fiber;
        'siblings: loop {
            while self.fibers[node].sibling.is_none() {
                match self.fibers[node].return_ {
                    Some(p) if !self.fibers[p].kind.is_host_parent() => node = p,
                    _ => return None,
                }
            }
            let (sibling, parent) = (self.fibers[node].sibling?, self.fibers[node].return_);
            self.fibers[sibling].return_ = parent;
            node = sibling;
            while !self.fibers[node].kind.is_host() {
                let f = &self.fibers[node];
                if f.flags.contains(Flags::PLACEMENT) || matches!(f.kind, FiberKind::HostPortal(_)) {
                    continue 'siblings;
                }
                let Some(child) = f.child else { continue 'siblings };
                self.fibers[child].return_ = Some(node);
                node = child;
            }
            if !self.fibers[node].flags.contains(Flags::PLACEMENT) {
                return self.fibers[node].state_node.host();
            }
        }
    }

    fn commit_placement(&mut self, fiber: FiberId) {
        let parent_fiber = self.fibers[fiber].return_;
        let Some(parent) = self.host_parent_from(parent_fiber) else {
            tracing::error!(target: "fibra.commit", error = %ReconcilerError::MissingHostParent, fiber = ?self.fibers[fiber].kind, "placement skipped");
            return;
        };
        if let HostParent::Node(node) = &parent
            && let Some(pf) = self.nearest_host_component(parent_fiber)
            && self.fibers[pf].flags.contains(Flags::CONTENT_RESET)
        {
            if let Some(inst) = self.host_nodes.get(*node).and_then(HostNode::as_instance) {
                self.host.reset_text_content(inst);
            }
            self.fibers[pf].flags.remove(Flags::CONTENT_RESET);
        }
        let before = self.host_sibling(fiber);
        self.insert_or_append_placement_node(fiber, before, &parent);
    }

    fn nearest_host_component(&self, start: Option<FiberId>) -> Option<FiberId> {
        let mut node = start;
        while let Some(id) = node {
            match self.fibers[id].kind {
                FiberKind::HostComponent(_) => return Some(id),
                FiberKind::HostRoot | FiberKind::HostPortal(_) => return None,
                _ => node = self.fibers[id].return_,
            }
        }
        None
    }

    fn insert_or_append_placement_node(
        &mut self,
        fiber: FiberId,
        before: Option<HostNodeId>,
        parent: &HostParent<H::Container>,
    ) {
        let f = &self.fibers[fiber];
        if f.kind.is_host() {
            if let Some(node) = f.state_node.host() {
                self.insert_host(parent, node, before);
            }
            return;
        }
        if matches!(f.kind, FiberKind::HostPortal(_)) {
            return;
        }
        for child in self.children_of(fiber) {
            self.insert_or_append_placement_node(child, before, parent);
        }
    }

    fn insert_host(&mut self, parent: &HostParent<H::Container>, node: HostNodeId, before: Option<HostNodeId>) {
        let Some(child) = self.host_nodes.get(node) else { return };
        let anchor = before.and_then(|b| self.host_nodes.get(b));
        match parent {
            HostParent::Node(p) => {
                let Some(p) = self.host_nodes.get(*p).and_then(HostNode::as_instance) else { return };
                match anchor {
                    Some(b) => self.host.insert_before(p, child.as_child(), b.as_child()),
                    None => self.host.append_child(p, child.as_child()),
                }
            }
            HostParent::Container(c) => match anchor {
                Some(b) => self.host.insert_in_container_before(c, child.as_child(), b.as_child()),
                None => self.host.append_child_to_container(c, child.as_child()),
            },
        }
    }

    fn remove_host(&mut self, parent: &HostParent<H::Container>, node: HostNodeId) {
        let Some(child) = self.host_nodes.get(node) else { return };
        match parent {
            HostParent::Node(p) => {
                if let Some(p) = self.host_nodes.get(*p).and_then(HostNode::as_instance) {
                    self.host.remove_child(p, child.as_child());
                }
            }
            HostParent::Container(c) => self.host.remove_child_from_container(c, child.as_child()),
        }
    }

    fn commit_deletion(&mut self, parent: FiberId, deleted: FiberId) {
        let host_parent = self.host_parent_from(Some(parent));
        tracing::trace!(target: "fibra.commit", fiber = ?self.fibers[deleted].kind, "deleting subtree");
        self.unmount_deleted(deleted, host_parent.as_ref(), parent);
        // Detach from the live tree; passive cleanup reaches it through `parent.deletions`.
        if let Some(alt) = self.fibers[deleted].alternate {
            self.fibers[alt].return_ = None;
        }
        self.fibers[deleted].return_ = None;
    }

    fn unmount_deleted(&mut self, fiber: FiberId, host_parent: Option<&HostParent<H::Container>>, nearest: FiberId) {
        match self.fibers[fiber].kind.clone() {
            FiberKind::HostComponent(_) | FiberKind::HostText => {
                if let Some(r) = &self.fibers[fiber].ref_ {
                    r.set(None);
                }
                for child in self.children_of(fiber) {
                    self.unmount_deleted(child, None, nearest);
                }
                if let Some(hp) = host_parent
                    && let Some(node) = self.fibers[fiber].state_node.host()
                {
                    self.remove_host(hp, node);
                }
            }
            FiberKind::HostPortal(portal) => {
                let container = self.portals.get(portal).cloned().map(HostParent::Container);
                for child in self.children_of(fiber) {
                    self.unmount_deleted(child, container.as_ref(), nearest);
                }
            }
            FiberKind::Class(_) => {
                if let Some(inst) = self.class_instance(fiber)
                    && let Err(error) = call_user_commit(|| inst.borrow_mut().component.component_will_unmount())
                {
                    self.capture_commit_phase_error(fiber, Some(nearest), error);
                }
                for child in self.children_of(fiber) {
                    self.unmount_deleted(child, host_parent, nearest);
                }
            }
            kind => {
                if matches!(kind, FiberKind::Function(_) | FiberKind::Memo(_) | FiberKind::Lazy(_)) {
                    self.commit_hook_unmounts(fiber, HookFlags::INSERTION, Some(nearest));
                    self.commit_hook_unmounts(fiber, HookFlags::LAYOUT, Some(nearest));
                }
                for child in self.children_of(fiber) {
                    self.unmount_deleted(child, host_parent, nearest);
                }
            }
        }
    }

    /// Toggle every top-level host node below an offscreen fiber.
    fn hide_or_unhide_all_children(&mut self, offscreen: FiberId, hide: bool) {
        let mut stack: Vec<FiberId> = self.children_of(offscreen).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            let f = &self.fibers[id];
            match &f.kind {
                FiberKind::HostComponent(_) | FiberKind::HostText => {
                    let Some(node) = f.state_node.host() else { continue };
                    let props = f.memoized_props.clone().unwrap_or_default();
                    match self.host_nodes.get(node) {
                        Some(HostNode::Instance(inst)) if hide => self.host.hide_instance(inst),
                        Some(HostNode::Instance(inst)) => self.host.unhide_instance(inst, props.attrs()),
                        Some(HostNode::Text(text)) if hide => self.host.hide_text_instance(text),
                        Some(HostNode::Text(text)) => {
                            self.host.unhide_text_instance(text, props.text().unwrap_or_default())
                        }
                        None => {}
                    }
                }
                FiberKind::HostPortal(_) => {}
                // A nested hidden tree stays hidden.
                FiberKind::Offscreen if matches!(f.memoized_state, MemoState::Offscreen(_)) => {}
                _ => stack.extend(self.children_of(id).into_iter().rev()),
            }
        }
    }

    // -- layout -------------------------------------------------------------

    fn commit_layout_effects(&mut self, fiber: FiberId) {
        for child in self.children_with(fiber, Flags::LAYOUT_MASK) {
            self.commit_layout_effects(child);
        }
        let flags = self.fibers[fiber].flags;
        if !flags.intersects(Flags::LAYOUT_MASK) {
            return;
        }
        let current = self.fibers[fiber].alternate;
        match self.fibers[fiber].kind.clone() {
            FiberKind::Function(_) | FiberKind::Memo(_) | FiberKind::Lazy(_) => {
                if flags.contains(Flags::UPDATE) {
                    self.commit_hook_mounts(fiber, HookFlags::LAYOUT | HookFlags::HAS_EFFECT);
                }
            }
            FiberKind::Class(_) => {
                if flags.contains(Flags::UPDATE) {
                    self.commit_class_lifecycle(fiber, current);
                }
                if flags.contains(Flags::CALLBACK) {
                    self.commit_update_callbacks(fiber);
                }
            }
            FiberKind::HostRoot => {
                if flags.contains(Flags::CALLBACK) {
                    self.commit_update_callbacks(fiber);
                }
            }
            FiberKind::HostComponent(ty) => {
                let Some(node) = self.fibers[fiber].state_node.host() else { return };
                if current.is_none() && flags.contains(Flags::UPDATE) {
                    let props = self.fibers[fiber].memoized_props.clone().unwrap_or_default();
                    if let Some(inst) = self.host_nodes.get(node).and_then(HostNode::as_instance) {
                        self.host.commit_mount(inst, &ty, props.attrs());
                    }
                }
                if flags.contains(Flags::REF)
                    && let Some(r) = &self.fibers[fiber].ref_
                    && let Some(inst) = self.host_nodes.get(node).and_then(HostNode::as_instance)
                {
                    let public = self.host.public_instance(inst);
                    r.set(Some(Rc::new(public)));
                }
            }
            FiberKind::Profiler(def) => {
                if flags.contains(Flags::UPDATE) && self.config.profiling {
                    let report = ProfilerReport {
                        id: def.id().to_owned(),
                        phase: if current.is_none() {
                            ProfilerPhase::Mount
                        } else {
                            ProfilerPhase::Update
                        },
                        actual_duration: self.fibers[fiber].actual_duration,
                        commit_time: self.shared.now(),
                    };
                    if let Err(error) = call_user_commit(|| {
                        def.report(&report);
                        Ok(())
                    }) {
                        self.capture_user_error(fiber, error);
                    }
                }
            }
            _ => {}
        }
    }

    fn commit_class_lifecycle(&mut self, fiber: FiberId, current: Option<FiberId>) {
        let Some(inst) = self.class_instance(fiber) else { return };
        let result = match current {
            None => call_user_commit(|| {
                let mut i = inst.borrow_mut();
                let (props, state) = (i.props.clone(), i.state.clone());
                i.component.component_did_mount(&props, &state)
            }),
            Some(cur) => {
                let prev_props = self.fibers[cur].memoized_props.clone().unwrap_or_default();
                let prev_state = match &self.fibers[cur].memoized_state {
                    MemoState::Class(s) => s.clone(),
                    _ => ClassState::default(),
                };
                call_user_commit(|| {
                    let mut i = inst.borrow_mut();
                    let (props, state, snapshot) = (i.props.clone(), i.state.clone(), i.snapshot.take());
                    i.component
                        .component_did_update(&props, &state, &prev_props, &prev_state, snapshot)
                })
            }
        };
        if let Err(error) = result {
            self.capture_user_error(fiber, error);
        }
    }

    fn commit_update_callbacks(&mut self, fiber: FiberId) {
        let callbacks = match &mut self.fibers[fiber].update_queue {
            FiberQueue::Class(queue) => std::mem::take(&mut queue.callbacks),
            FiberQueue::Root(queue) => std::mem::take(&mut queue.callbacks),
            _ => return,
        };
        for callback in callbacks {
            match callback {
                UpdateCallback::User(slot) => {
                    let f = slot.borrow_mut().take();
                    if let Some(f) = f
                        && let Err(error) = call_user_commit(|| {
                            f();
                            Ok(())
                        })
                    {
                        self.capture_user_error(fiber, error);
                    }
                }
                UpdateCallback::DidCatch {
                    error,
                    without_derived_state,
                } => {
                    let Some(inst) = self.class_instance(fiber) else { continue };
                    if without_derived_state {
                        inst.borrow_mut().failed = true;
                        self.failed_boundaries.push(inst.clone());
                    }
                    self.observer
                        .on_caught_error(&error.error, &error.info, &self.fibers[fiber].kind.name());
                    tracing::debug!(
                        target: "fibra.commit",
                        boundary = %self.fibers[fiber].kind.name(),
                        error = %error.error,
                        "error caught by boundary"
                    );
                    if let Err(thrown) =
                        call_user_commit(|| {
                            inst.borrow_mut().component.component_did_catch(&error.error, &error.info);
                            Ok(())
                        })
                    {
                        self.capture_user_error(fiber, thrown);
                    }
                }
                UpdateCallback::Uncaught(captured) => self.report_uncaught_error(&captured),
            }
        }
    }
}
