#![forbid(unsafe_code)]

//! Suspense boundaries, offscreen trees and suspense lists.
//!
//! A suspense fiber always has an offscreen child holding the primary
//! children. While the boundary shows its fallback, the offscreen child is
//! hidden and a fragment holding the fallback follows it as a sibling, so
//! primary state survives the fallback.
//!
//! # Invariants
//!
//! - A boundary already showing its fallback never captures a new
//!   suspension; the next boundary up does.
//! - A hidden offscreen tree in a concurrent root renders only at
//!   [`Lanes::OFFSCREEN`]; other renders skip it and leave it on that lane.
//! - A ping for a wakeable is attached at most once per root and lane set;
//!   a retry listener at most once per boundary.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Ping arrives for a root that already committed | Root marked pinged and rescheduled |
//! | Retry arrives for an unmounted boundary | Ignored |

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashSet;
use bitflags::bitflags;
use fibra_core::{FiberId, Flags, HostConfig, Lanes, RootId, Timestamp, Wakeable};

use crate::element::{Element, ElementType, OffscreenMode, Props, PropsExtra, RevealOrder, TailMode};
use crate::fiber::{Fiber, FiberKind, FiberQueue, MemoState, StateNode};
use crate::reconciler::Reconciler;
use crate::shared::InboxEntry;
use crate::work_loop::ExitStatus;

bitflags! {
    /// Suspense context pushed by boundaries and lists.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct SuspenseContext: u8 {
        /// Inherited: an ancestor boundary is mounting or showing its fallback.
        const INVISIBLE_PARENT = 1 << 0;
        /// Shallow: boundaries directly below must show their fallback.
        const FORCE_FALLBACK = 1 << 1;
    }
}

impl SuspenseContext {
    fn with_default_shallow(self) -> Self {
        self & Self::INVISIBLE_PARENT
    }

    fn with_shallow(self, shallow: Self) -> Self {
        (self & Self::INVISIBLE_PARENT) | shallow
    }
}

/// Memoized state of a hidden offscreen fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OffscreenState {
    /// Lanes the hidden tree skipped and must render when revealed.
    pub(crate) base_lanes: Lanes,
}

/// Row bookkeeping of an ordered suspense list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListRenderState {
    pub(crate) is_backwards: bool,
    /// Tail row currently being rendered.
    pub(crate) rendering: Option<FiberId>,
    pub(crate) rendering_start_time: Timestamp,
    /// Last row already appended to the list's children.
    pub(crate) last: Option<FiberId>,
    /// Rows not yet rendered, linked by `sibling`.
    pub(crate) tail: Option<FiberId>,
    pub(crate) tail_mode: Option<TailMode>,
}

fn offscreen_props(mode: OffscreenMode, children: Vec<Element>) -> Props {
    Props::from_parts(Default::default(), children, PropsExtra::Offscreen(mode))
}

impl<H: HostConfig> Reconciler<H> {
    // -- context stack ------------------------------------------------------

    pub(crate) fn push_suspense_context(&mut self, ctx: SuspenseContext) {
        let s = &mut self.session;
        s.suspense_stack.push(s.suspense_context);
        s.suspense_context = ctx;
    }

    pub(crate) fn pop_suspense_context(&mut self) {
        let s = &mut self.session;
        s.suspense_context = s.suspense_stack.pop().unwrap_or_default();
    }

    /// Push the parent's context unchanged except for shallow flags.
    pub(crate) fn push_default_suspense_context(&mut self) {
        let ctx = self.session.suspense_context.with_default_shallow();
        self.push_suspense_context(ctx);
    }

    // -- suspense -----------------------------------------------------------

    fn insert_child_fiber(&mut self, mut fiber: Fiber, parent: FiberId) -> FiberId {
        fiber.return_ = Some(parent);
        self.fibers.insert(fiber)
    }

    fn fallback_fragment(&mut self, parent: FiberId, fallback: Element, render_lanes: Lanes) -> FiberId {
        let mode = self.fibers[parent].mode;
        let mut f = Fiber::new(
            FiberKind::Fragment,
            Some(ElementType::Fragment),
            None,
            Props::with_children(vec![fallback]),
            mode,
        );
        f.lanes = render_lanes;
        self.insert_child_fiber(f, parent)
    }

    fn offscreen_fiber(&mut self, parent: FiberId, props: Props, lanes: Lanes) -> FiberId {
        let mode = self.fibers[parent].mode;
        let mut f = Fiber::new(FiberKind::Offscreen, Some(ElementType::Offscreen), None, props, mode);
        f.lanes = lanes;
        self.insert_child_fiber(f, parent)
    }

    fn should_remain_on_fallback(&self, ctx: SuspenseContext, current: Option<FiberId>) -> bool {
        if let Some(cur) = current
            && !matches!(self.fibers[cur].memoized_state, MemoState::SuspenseFallback)
        {
            return false;
        }
        ctx.contains(SuspenseContext::FORCE_FALLBACK)
    }

    pub(crate) fn update_suspense_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let props = self.fibers[wip].pending_props.clone();
        let mut ctx = self.session.suspense_context;
        let did_suspend = self.fibers[wip].flags.contains(Flags::DID_CAPTURE);
        let show_fallback = did_suspend || self.should_remain_on_fallback(ctx, current);
        if show_fallback {
            self.fibers[wip].flags.remove(Flags::DID_CAPTURE);
        } else if current.is_none_or(|c| matches!(self.fibers[c].memoized_state, MemoState::SuspenseFallback)) {
            ctx |= SuspenseContext::INVISIBLE_PARENT;
        }
        self.push_suspense_context(ctx.with_default_shallow());

        let primary_children = props.children().to_vec();
        let fallback = props.fallback().cloned().unwrap_or_else(Element::empty);
        let current_primary = current.and_then(|c| self.fibers[c].child);

        let (Some(cur), Some(cur_primary)) = (current, current_primary) else {
            // Mount.
            if show_fallback {
                let primary = self.offscreen_fiber(wip, offscreen_props(OffscreenMode::Hidden, primary_children), Lanes::NONE);
                self.fibers[primary].memoized_state = MemoState::Offscreen(OffscreenState { base_lanes: render_lanes });
                let fallback_fiber = self.fallback_fragment(wip, fallback, render_lanes);
                self.fibers[primary].sibling = Some(fallback_fiber);
                let w = &mut self.fibers[wip];
                w.child = Some(primary);
                w.memoized_state = MemoState::SuspenseFallback;
                return Some(fallback_fiber);
            }
            let primary = self.offscreen_fiber(wip, offscreen_props(OffscreenMode::Visible, primary_children), render_lanes);
            let w = &mut self.fibers[wip];
            w.child = Some(primary);
            w.memoized_state = MemoState::None;
            return Some(primary);
        };

        let current_fallback = self.fibers[cur_primary].sibling;
        if show_fallback {
            let primary = self.create_work_in_progress(cur_primary, offscreen_props(OffscreenMode::Hidden, primary_children));
            let base_lanes = match &self.fibers[cur_primary].memoized_state {
                MemoState::Offscreen(prev) => prev.base_lanes | render_lanes,
                _ => render_lanes,
            };
            let remaining = self.fibers[cur].child_lanes.remove(render_lanes);
            let static_subtree = self.fibers[cur_primary].subtree_flags & Flags::STATIC_MASK;
            let fallback_fiber = match current_fallback {
                Some(cf) => self.create_work_in_progress(cf, Props::with_children(vec![fallback])),
                None => {
                    let f = self.fallback_fragment(wip, fallback, render_lanes);
                    self.fibers[f].flags |= Flags::PLACEMENT;
                    f
                }
            };
            let p = &mut self.fibers[primary];
            p.subtree_flags = static_subtree;
            p.memoized_state = MemoState::Offscreen(OffscreenState { base_lanes });
            p.child_lanes = remaining;
            p.return_ = Some(wip);
            p.sibling = Some(fallback_fiber);
            self.fibers[fallback_fiber].return_ = Some(wip);
            self.fibers[fallback_fiber].sibling = None;
            let w = &mut self.fibers[wip];
            w.child = Some(primary);
            w.memoized_state = MemoState::SuspenseFallback;
            return Some(fallback_fiber);
        }

        let primary = self.create_work_in_progress(cur_primary, offscreen_props(OffscreenMode::Visible, primary_children));
        let p = &mut self.fibers[primary];
        p.return_ = Some(wip);
        p.sibling = None;
        if !p.is_concurrent() {
            p.lanes = render_lanes;
        }
        let w = &mut self.fibers[wip];
        if let Some(cf) = current_fallback {
            w.deletions.push(cf);
            w.flags |= Flags::CHILD_DELETION;
        }
        w.child = Some(primary);
        w.memoized_state = MemoState::None;
        Some(primary)
    }

    /// Complete a suspense fiber; returns it again to re-render with the
    /// fallback.
    pub(crate) fn complete_suspense(&mut self, current: Option<FiberId>, wip: FiberId) -> Option<FiberId> {
        self.pop_suspense_context();
        if self.fibers[wip].flags.contains(Flags::DID_CAPTURE) {
            self.fibers[wip].lanes = self.session.subtree_render_lanes;
            return Some(wip);
        }
        let next_timed_out = matches!(self.fibers[wip].memoized_state, MemoState::SuspenseFallback);
        let prev_timed_out = current.is_some_and(|c| matches!(self.fibers[c].memoized_state, MemoState::SuspenseFallback));
        if next_timed_out && !prev_timed_out {
            if let Some(offscreen) = self.fibers[wip].child {
                self.fibers[offscreen].flags |= Flags::VISIBILITY;
            }
            if self.fibers[wip].is_concurrent() {
                let invisible_parent = current.is_none()
                    || self.session.suspense_context.contains(SuspenseContext::INVISIBLE_PARENT);
                if invisible_parent {
                    self.render_did_suspend();
                } else {
                    self.render_did_suspend_delay_if_possible();
                }
            }
        }
        if matches!(&self.fibers[wip].update_queue, FiberQueue::Retry(list) if !list.is_empty()) {
            self.fibers[wip].flags |= Flags::UPDATE;
        }
        self.bubble_properties(wip);
        None
    }

    // -- offscreen ----------------------------------------------------------

    pub(crate) fn update_offscreen_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let props = self.fibers[wip].pending_props.clone();
        let prev = current.and_then(|c| match &self.fibers[c].memoized_state {
            MemoState::Offscreen(state) => Some(*state),
            _ => None,
        });

        if props.offscreen_mode() == OffscreenMode::Hidden {
            if !self.fibers[wip].is_concurrent() {
                self.fibers[wip].memoized_state = MemoState::Offscreen(OffscreenState { base_lanes: Lanes::NONE });
                self.push_render_lanes(render_lanes);
            } else if !render_lanes.includes_some(Lanes::OFFSCREEN) {
                let base_lanes = prev.map_or(render_lanes, |p| p.base_lanes | render_lanes);
                let w = &mut self.fibers[wip];
                w.lanes = Lanes::OFFSCREEN;
                w.child_lanes = Lanes::OFFSCREEN;
                w.memoized_state = MemoState::Offscreen(OffscreenState { base_lanes });
                self.push_render_lanes(base_lanes);
                tracing::trace!(target: "fibra.begin", "hidden subtree deferred to offscreen lane");
                return None;
            } else {
                self.fibers[wip].memoized_state = MemoState::Offscreen(OffscreenState { base_lanes: Lanes::NONE });
                let subtree = prev.map_or(render_lanes, |p| p.base_lanes);
                self.push_render_lanes(subtree);
            }
        } else {
            let subtree = match prev {
                Some(p) => {
                    self.fibers[wip].memoized_state = MemoState::None;
                    p.base_lanes | render_lanes
                }
                None => render_lanes,
            };
            self.push_render_lanes(subtree);
        }
        self.reconcile_children(current, wip, props.children(), render_lanes);
        self.fibers[wip].child
    }

    pub(crate) fn complete_offscreen(&mut self, current: Option<FiberId>, wip: FiberId) {
        self.pop_render_lanes();
        let next_hidden = matches!(self.fibers[wip].memoized_state, MemoState::Offscreen(_));
        let prev_hidden = current.is_some_and(|cur| matches!(self.fibers[cur].memoized_state, MemoState::Offscreen(_)));
        if prev_hidden != next_hidden {
            self.fibers[wip].flags |= Flags::VISIBILITY;
        }
        if !next_hidden || !self.fibers[wip].is_concurrent() {
            self.bubble_properties(wip);
        } else if self.session.subtree_render_lanes.includes_some(Lanes::OFFSCREEN) {
            self.bubble_properties(wip);
            // Pre-rendered nodes must be hidden too.
            if self.fibers[wip].subtree_flags.intersects(Flags::PLACEMENT | Flags::UPDATE) {
                self.fibers[wip].flags |= Flags::VISIBILITY;
            }
        }
    }

    // -- suspense list ------------------------------------------------------

    /// First boundary under `row` showing a fallback, or a list that suspended.
    pub(crate) fn find_first_suspended(&mut self, row: FiberId) -> Option<FiberId> {
        let mut node = row;
        loop {
            let f = &self.fibers[node];
            match &f.kind {
                FiberKind::Suspense => {
                    if matches!(f.memoized_state, MemoState::SuspenseFallback) {
                        return Some(node);
                    }
                }
                FiberKind::SuspenseList(cfg) if cfg.reveal_order.is_some() => {
                    if f.flags.contains(Flags::DID_CAPTURE) {
                        return Some(node);
                    }
                }
                _ => {
                    if let Some(child) = f.child {
                        self.fibers[child].return_ = Some(node);
                        node = child;
                        continue;
                    }
                }
            }
            if node == row {
                return None;
            }
            loop {
                if let Some(sibling) = self.fibers[node].sibling {
                    self.fibers[sibling].return_ = self.fibers[node].return_;
                    node = sibling;
                    break;
                }
                match self.fibers[node].return_ {
                    Some(parent) if parent != row => node = parent,
                    _ => return None,
                }
            }
        }
    }

    fn find_last_content_row(&mut self, first: Option<FiberId>) -> Option<FiberId> {
        let mut last = None;
        let mut row = first;
        while let Some(r) = row {
            if let Some(current_row) = self.fibers[r].alternate
                && self.find_first_suspended(current_row).is_none()
            {
                last = Some(r);
            }
            row = self.fibers[r].sibling;
        }
        last
    }

    /// Schedule `render_lanes` on every boundary below `first` that may
    /// change because the list context changed.
    fn propagate_suspense_context_change(&mut self, list: FiberId, first: Option<FiberId>, render_lanes: Lanes) {
        let Some(mut node) = first else { return };
        loop {
            let f = &self.fibers[node];
            let schedule = match &f.kind {
                FiberKind::Suspense => matches!(f.memoized_state, MemoState::SuspenseFallback),
                FiberKind::SuspenseList(_) => true,
                _ => {
                    if let Some(child) = f.child {
                        self.fibers[child].return_ = Some(node);
                        node = child;
                        continue;
                    }
                    false
                }
            };
            if schedule {
                self.fibers[node].lanes |= render_lanes;
                if let Some(alt) = self.fibers[node].alternate {
                    self.fibers[alt].lanes |= render_lanes;
                }
                let parent = self.fibers[node].return_;
                self.schedule_context_work_on_parent_path(parent, render_lanes);
            }
            if node == list {
                return;
            }
            loop {
                if let Some(sibling) = self.fibers[node].sibling {
                    self.fibers[sibling].return_ = self.fibers[node].return_;
                    node = sibling;
                    break;
                }
                match self.fibers[node].return_ {
                    Some(parent) if parent != list => node = parent,
                    _ => return,
                }
            }
        }
    }

    pub(crate) fn update_suspense_list_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let FiberKind::SuspenseList(config) = self.fibers[wip].kind else {
            return None;
        };
        let props = self.fibers[wip].pending_props.clone();
        self.reconcile_children(current, wip, props.children(), render_lanes);

        let mut ctx = self.session.suspense_context;
        if ctx.contains(SuspenseContext::FORCE_FALLBACK) {
            ctx = ctx.with_shallow(SuspenseContext::FORCE_FALLBACK);
            self.fibers[wip].flags |= Flags::DID_CAPTURE;
        } else {
            if current.is_some_and(|c| self.fibers[c].flags.contains(Flags::DID_CAPTURE)) {
                let first = self.fibers[wip].child;
                self.propagate_suspense_context_change(wip, first, render_lanes);
            }
            ctx = ctx.with_default_shallow();
        }
        self.push_suspense_context(ctx);

        if !self.fibers[wip].is_concurrent() {
            self.fibers[wip].memoized_state = MemoState::None;
            return self.fibers[wip].child;
        }
        match config.reveal_order {
            Some(RevealOrder::Forwards) => {
                let first = self.fibers[wip].child;
                let last_content = self.find_last_content_row(first);
                let tail = match last_content {
                    None => self.fibers[wip].child.take(),
                    Some(last) => self.fibers[last].sibling.take(),
                };
                self.init_list_render_state(wip, false, tail, last_content, config.tail);
            }
            Some(RevealOrder::Backwards) => {
                let mut tail = None;
                let mut row = self.fibers[wip].child.take();
                while let Some(r) = row {
                    if let Some(current_row) = self.fibers[r].alternate
                        && self.find_first_suspended(current_row).is_none()
                    {
                        self.fibers[wip].child = Some(r);
                        break;
                    }
                    let next = self.fibers[r].sibling;
                    self.fibers[r].sibling = tail;
                    tail = Some(r);
                    row = next;
                }
                self.init_list_render_state(wip, true, tail, None, config.tail);
            }
            Some(RevealOrder::Together) => self.init_list_render_state(wip, false, None, None, None),
            None => self.fibers[wip].memoized_state = MemoState::None,
        }
        self.fibers[wip].child
    }

    fn init_list_render_state(
        &mut self,
        wip: FiberId,
        is_backwards: bool,
        tail: Option<FiberId>,
        last: Option<FiberId>,
        tail_mode: Option<TailMode>,
    ) {
        self.fibers[wip].memoized_state = MemoState::SuspenseList(ListRenderState {
            is_backwards,
            rendering: None,
            rendering_start_time: 0,
            last,
            tail,
            tail_mode,
        });
    }

    fn cut_off_tail_if_needed(&mut self, state: &mut ListRenderState, has_rendered_a_tail_fallback: bool) {
        let Some(mode) = state.tail_mode else { return };
        let mut node = state.tail;
        let mut last_existing = None;
        while let Some(n) = node {
            if self.fibers[n].alternate.is_some() {
                last_existing = Some(n);
            }
            node = self.fibers[n].sibling;
        }
        match (last_existing, mode) {
            (Some(last), _) => self.fibers[last].sibling = None,
            (None, TailMode::Hidden) => state.tail = None,
            (None, TailMode::Collapsed) => match state.tail {
                // Keep one fallback row visible.
                Some(tail) if !has_rendered_a_tail_fallback => self.fibers[tail].sibling = None,
                _ => state.tail = None,
            },
        }
    }

    fn reset_child_fibers(&mut self, wip: FiberId, render_lanes: Lanes) {
        let mut child = self.fibers[wip].child;
        while let Some(c) = child {
            self.reset_work_in_progress(c, render_lanes);
            child = self.fibers[c].sibling;
        }
    }

    fn copy_retry_queue(&mut self, from: FiberId, to: FiberId) {
        if let FiberQueue::Retry(list) = &self.fibers[from].update_queue
            && !list.is_empty()
        {
            let list = list.clone();
            let t = &mut self.fibers[to];
            t.update_queue = FiberQueue::Retry(list);
            t.flags |= Flags::UPDATE;
        }
    }

    /// Complete a list; may hand back a row (or the reset children) to render.
    pub(crate) fn complete_suspense_list(&mut self, current: Option<FiberId>, wip: FiberId) -> Option<FiberId> {
        self.pop_suspense_context();
        let MemoState::SuspenseList(mut state) = self.fibers[wip].memoized_state.clone() else {
            self.bubble_properties(wip);
            return None;
        };
        let now = self.shared.now();
        let mut did_suspend_already = self.fibers[wip].flags.contains(Flags::DID_CAPTURE);

        match state.rendering {
            None => {
                if did_suspend_already {
                    self.cut_off_tail_if_needed(&mut state, false);
                } else {
                    let cannot_be_suspended = self.session.exit_status == ExitStatus::InProgress
                        && current.is_none_or(|c| !self.fibers[c].flags.contains(Flags::DID_CAPTURE));
                    if !cannot_be_suspended {
                        let mut row = self.fibers[wip].child;
                        while let Some(r) = row {
                            if let Some(suspended) = self.find_first_suspended(r) {
                                self.fibers[wip].flags |= Flags::DID_CAPTURE;
                                self.cut_off_tail_if_needed(&mut state, false);
                                self.copy_retry_queue(suspended, wip);
                                self.fibers[wip].subtree_flags = Flags::empty();
                                self.fibers[wip].memoized_state = MemoState::SuspenseList(state);
                                let lanes = self.session.subtree_render_lanes;
                                self.reset_child_fibers(wip, lanes);
                                let ctx = self.session.suspense_context.with_shallow(SuspenseContext::FORCE_FALLBACK);
                                self.push_suspense_context(ctx);
                                return self.fibers[wip].child;
                            }
                            row = self.fibers[r].sibling;
                        }
                    }
                    if state.tail.is_some() && now > self.session.render_target_time {
                        // Out of time: show what we have and finish the rest in a retry.
                        self.fibers[wip].flags |= Flags::DID_CAPTURE;
                        did_suspend_already = true;
                        self.cut_off_tail_if_needed(&mut state, false);
                        self.fibers[wip].lanes = Lanes::SOME_RETRY;
                    }
                }
            }
            Some(rendered_tail) => {
                if !did_suspend_already {
                    if let Some(suspended) = self.find_first_suspended(rendered_tail) {
                        self.fibers[wip].flags |= Flags::DID_CAPTURE;
                        did_suspend_already = true;
                        self.copy_retry_queue(suspended, wip);
                        self.cut_off_tail_if_needed(&mut state, true);
                        if state.tail.is_none()
                            && state.tail_mode == Some(TailMode::Hidden)
                            && self.fibers[rendered_tail].alternate.is_none()
                        {
                            // Nothing of the hidden tail may show; drop this row.
                            self.fibers[wip].memoized_state = MemoState::SuspenseList(state);
                            self.bubble_properties(wip);
                            return None;
                        }
                    } else if now + (now - state.rendering_start_time) > self.session.render_target_time
                        && self.session.render_lanes != Lanes::OFFSCREEN
                    {
                        // The next row would likely overrun the budget.
                        self.fibers[wip].flags |= Flags::DID_CAPTURE;
                        did_suspend_already = true;
                        self.cut_off_tail_if_needed(&mut state, false);
                        self.fibers[wip].lanes = Lanes::SOME_RETRY;
                    }
                }
                if state.is_backwards {
                    self.fibers[rendered_tail].sibling = self.fibers[wip].child;
                    self.fibers[wip].child = Some(rendered_tail);
                } else {
                    match state.last {
                        Some(prev) => self.fibers[prev].sibling = Some(rendered_tail),
                        None => self.fibers[wip].child = Some(rendered_tail),
                    }
                    state.last = Some(rendered_tail);
                }
            }
        }

        if let Some(next) = state.tail {
            state.rendering = Some(next);
            state.tail = self.fibers[next].sibling.take();
            state.rendering_start_time = now;
            self.fibers[next].return_ = Some(wip);
            self.fibers[wip].memoized_state = MemoState::SuspenseList(state);
            let ctx = if did_suspend_already {
                self.session.suspense_context.with_shallow(SuspenseContext::FORCE_FALLBACK)
            } else {
                self.session.suspense_context.with_default_shallow()
            };
            self.push_suspense_context(ctx);
            return Some(next);
        }
        self.fibers[wip].memoized_state = MemoState::SuspenseList(state);
        self.bubble_properties(wip);
        None
    }

    // -- pings and retries --------------------------------------------------

    /// Re-render `root` on `lanes` when `wakeable` settles.
    pub(crate) fn attach_ping_listener(&mut self, root: RootId, wakeable: &Wakeable, lanes: Lanes) {
        let Some(r) = self.roots.get_mut(root) else { return };
        let id = wakeable.id();
        let attached = r.ping_cache.entry(id).or_insert(Lanes::NONE);
        if attached.contains(lanes) {
            return;
        }
        *attached |= lanes;
        let shared = Rc::downgrade(&self.shared);
        wakeable.then(move || {
            if let Some(shared) = shared.upgrade() {
                shared.post(InboxEntry::Ping {
                    root,
                    wakeable: id,
                    lanes,
                });
            }
        });
    }

    pub(crate) fn ping_suspended_root(&mut self, root: RootId, wakeable: u64, lanes: Lanes) {
        let Some(r) = self.roots.get_mut(root) else { return };
        r.ping_cache.remove(&wakeable);
        r.lanes.mark_root_pinged(lanes);
        tracing::debug!(target: "fibra.root", wakeable, lanes = %lanes, "root pinged");

        let render_lanes = self.session.render_lanes;
        if self.session.root == Some(root) && lanes.contains(render_lanes) {
            let now = self.shared.now();
            let status = self.session.exit_status;
            let throttled = status == ExitStatus::Suspended
                && render_lanes.includes_only_retries()
                && now - self.most_recent_fallback_time < self.config.fallback_throttle_ms;
            if status == ExitStatus::SuspendedWithDelay || throttled {
                // Restart from the root; the suspended work can now finish.
                self.reset_session();
            } else {
                self.session.pinged_lanes |= lanes;
            }
        }
        self.ensure_root_is_scheduled(root);
    }

    pub(crate) fn retry_timed_out_boundary(&mut self, boundary: FiberId, wakeable: u64) {
        let Some(f) = self.fibers.get(boundary) else { return };
        if let StateNode::RetryCache(cache) = &f.state_node {
            cache.borrow_mut().remove(&wakeable);
        }
        let lane = if f.is_concurrent() {
            self.shared.lanes.claim_next_retry_lane()
        } else {
            Lanes::SYNC
        };
        let now = self.shared.now();
        tracing::debug!(target: "fibra.root", wakeable, lane = %lane, "retrying suspense boundary");
        if let Some(root) = self.mark_update_lane_from_fiber_to_root(boundary, lane) {
            self.roots[root].lanes.mark_root_updated(lane, now);
            self.ensure_root_is_scheduled(root);
        }
    }

    /// Commit-time: retry `finished` once each wakeable it waits on settles.
    pub(crate) fn attach_suspense_retry_listeners(&mut self, finished: FiberId) {
        let FiberQueue::Retry(wakeables) = std::mem::take(&mut self.fibers[finished].update_queue) else {
            return;
        };
        let cache = match &self.fibers[finished].state_node {
            StateNode::RetryCache(cache) => cache.clone(),
            _ => {
                let cache: Rc<RefCell<AHashSet<u64>>> = Rc::default();
                self.fibers[finished].state_node = StateNode::RetryCache(cache.clone());
                if let Some(alt) = self.fibers[finished].alternate {
                    self.fibers[alt].state_node = StateNode::RetryCache(cache.clone());
                }
                cache
            }
        };
        for wakeable in wakeables {
            let id = wakeable.id();
            if !cache.borrow_mut().insert(id) {
                continue;
            }
            let shared = Rc::downgrade(&self.shared);
            wakeable.then(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.post(InboxEntry::Retry {
                        boundary: finished,
                        wakeable: id,
                    });
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_flags_do_not_inherit() {
        let ctx = SuspenseContext::INVISIBLE_PARENT | SuspenseContext::FORCE_FALLBACK;
        assert_eq!(ctx.with_default_shallow(), SuspenseContext::INVISIBLE_PARENT);
        assert_eq!(
            SuspenseContext::empty().with_shallow(SuspenseContext::FORCE_FALLBACK),
            SuspenseContext::FORCE_FALLBACK
        );
    }
}
