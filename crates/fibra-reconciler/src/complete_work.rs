#![forbid(unsafe_code)]

//! Complete phase: create or diff host nodes and bubble subtree facts.
//!
//! Completion runs bottom-up. A mounting host component gets its instance
//! here, with every host descendant already attached; an updating one gets
//! an update payload stored for commit. Every fiber then folds its
//! children's lanes and flags into `child_lanes` and `subtree_flags`, which
//! is what lets bailouts and commit skip whole subtrees.
//!
//! Fibers marked [`Flags::INCOMPLETE`] go through [`Reconciler::unwind_work`]
//! instead, which pops context and hands back the first boundary that
//! should render again.

use fibra_core::{FiberId, Flags, HostConfig, HostNode, Lanes, Mode};

use crate::fiber::{FiberKind, StateNode};
use crate::reconciler::Reconciler;

impl<H: HostConfig> Reconciler<H> {
    /// Complete `wip`; returns a fiber to begin next when completion
    /// spawned more work (suspense retries, list rows).
    pub(crate) fn complete_work(&mut self, current: Option<FiberId>, wip: FiberId) -> Option<FiberId> {
        let kind = self.fibers[wip].kind.clone();
        match kind {
            FiberKind::Fragment
            | FiberKind::Function(_)
            | FiberKind::Class(_)
            | FiberKind::Memo(_)
            | FiberKind::Lazy(_)
            | FiberKind::Consumer(_)
            | FiberKind::Profiler(_) => {
                self.bubble_properties(wip);
                None
            }
            FiberKind::Provider(_) => {
                self.session.contexts.pop();
                self.bubble_properties(wip);
                None
            }
            FiberKind::HostRoot => {
                self.pop_host_container();
                if current.is_none_or(|c| self.fibers[c].child.is_none()) {
                    // First mount: clear whatever the container held before.
                    self.fibers[wip].flags |= Flags::SNAPSHOT;
                }
                self.bubble_properties(wip);
                None
            }
            FiberKind::HostPortal(_) => {
                self.pop_host_container();
                self.bubble_properties(wip);
                None
            }
            FiberKind::HostComponent(ty) => {
                self.pop_host_context();
                self.complete_host_component(current, wip, &ty);
                self.bubble_properties(wip);
                None
            }
            FiberKind::HostText => {
                self.complete_host_text(current, wip);
                self.bubble_properties(wip);
                None
            }
            FiberKind::Suspense => self.complete_suspense(current, wip),
            FiberKind::SuspenseList(_) => self.complete_suspense_list(current, wip),
            FiberKind::Offscreen => {
                self.complete_offscreen(current, wip);
                None
            }
        }
    }

    fn complete_host_component(&mut self, current: Option<FiberId>, wip: FiberId, ty: &str) {
        let Some(ctx) = self.session.host_contexts.last().cloned() else {
            tracing::error!(target: "fibra.complete", ty, "no host context for host component");
            return;
        };
        let new_props = self.fibers[wip].pending_props.clone();

        if let Some(cur) = current
            && let Some(node) = self.fibers[wip].state_node.host()
        {
            let old_props = self.fibers[cur].memoized_props.clone().unwrap_or_default();
            if old_props.ptr_eq(&new_props) {
                return;
            }
            let payload = match self.host_nodes.get(node).and_then(HostNode::as_instance) {
                Some(instance) => self
                    .host
                    .prepare_update(instance, ty, old_props.attrs(), new_props.attrs(), &ctx),
                None => None,
            };
            if let Some(payload) = payload {
                self.host_payloads.insert(wip, payload);
                self.fibers[wip].flags |= Flags::UPDATE;
            }
            return;
        }

        let Some(container) = self.session.containers.last().cloned() else {
            tracing::error!(target: "fibra.complete", ty, "no container for host component");
            return;
        };
        let instance = self.host.create_instance(ty, new_props.attrs(), &container, &ctx);
        self.append_all_children(&instance, wip);
        if self.host.finalize_initial_children(&instance, ty, new_props.attrs(), &ctx) {
            self.fibers[wip].flags |= Flags::UPDATE;
        }
        let node = self.host_nodes.insert(HostNode::Instance(instance));
        let f = &mut self.fibers[wip];
        f.state_node = StateNode::Host(node);
        if f.ref_.is_some() {
            f.flags |= Flags::REF | Flags::REF_STATIC;
        }
        tracing::trace!(target: "fibra.complete", ty, "host instance created");
    }

    fn complete_host_text(&mut self, current: Option<FiberId>, wip: FiberId) {
        let new_text = self.fibers[wip].pending_props.text().unwrap_or_default().to_owned();
        if let Some(cur) = current
            && self.fibers[wip].state_node.host().is_some()
        {
            let changed = self.fibers[cur]
                .memoized_props
                .as_ref()
                .and_then(|p| p.text())
                .is_none_or(|old| old != new_text);
            if changed {
                self.fibers[wip].flags |= Flags::UPDATE;
            }
            return;
        }
        let (Some(ctx), Some(container)) = (
            self.session.host_contexts.last().cloned(),
            self.session.containers.last().cloned(),
        ) else {
            tracing::error!(target: "fibra.complete", "no host context for text");
            return;
        };
        let text = self.host.create_text_instance(&new_text, &container, &ctx);
        let node = self.host_nodes.insert(HostNode::Text(text));
        self.fibers[wip].state_node = StateNode::Host(node);
    }

    /// Append the top-level host nodes below `wip` to a fresh instance.
    fn append_all_children(&mut self, parent: &H::Instance, wip: FiberId) {
        let mut node = self.fibers[wip].child;
        while let Some(n) = node {
            let f = &self.fibers[n];
            if f.kind.is_host() {
                if let Some(id) = f.state_node.host()
                    && let Some(child) = self.host_nodes.get(id)
                {
                    self.host.append_initial_child(parent, child.as_child());
                }
            } else if !matches!(f.kind, FiberKind::HostPortal(_))
                && let Some(child) = f.child
            {
                node = Some(child);
                continue;
            }
            // Climb until a sibling exists, stopping at `wip`.
            let mut cursor = n;
            node = loop {
                if let Some(sibling) = self.fibers[cursor].sibling {
                    break Some(sibling);
                }
                match self.fibers[cursor].return_ {
                    Some(p) if p != wip => cursor = p,
                    _ => break None,
                }
            };
        }
    }

    /// Fold children's lanes and flags into `wip`.
    pub(crate) fn bubble_properties(&mut self, wip: FiberId) {
        let did_bailout = self.fibers[wip]
            .alternate
            .is_some_and(|cur| self.fibers[cur].child == self.fibers[wip].child);
        let mut lanes = Lanes::NONE;
        let mut subtree = Flags::empty();
        let mut duration = 0;
        let mut child = self.fibers[wip].child;
        while let Some(c) = child {
            let f = &mut self.fibers[c];
            lanes |= f.lanes | f.child_lanes;
            if did_bailout {
                // Children are the committed ones; only static flags carry over.
                subtree |= (f.subtree_flags | f.flags) & Flags::STATIC_MASK;
            } else {
                subtree |= f.subtree_flags | f.flags;
                f.return_ = Some(wip);
                duration += f.actual_duration;
            }
            child = f.sibling;
        }
        let profiling = self.config.profiling;
        let w = &mut self.fibers[wip];
        w.subtree_flags |= subtree;
        w.child_lanes = lanes;
        if profiling && !did_bailout && w.mode.contains(Mode::PROFILE) {
            w.actual_duration += duration;
        }
    }

    /// Unwind an incomplete fiber; returns it if it captured and must render
    /// again.
    pub(crate) fn unwind_work(&mut self, _current: Option<FiberId>, wip: FiberId) -> Option<FiberId> {
        let kind = self.fibers[wip].kind.clone();
        let flags = self.fibers[wip].flags;
        match kind {
            FiberKind::Class(_) => {
                if flags.contains(Flags::SHOULD_CAPTURE) {
                    return Some(self.flip_capture(wip));
                }
            }
            FiberKind::HostRoot => {
                self.pop_host_container();
                if flags.contains(Flags::SHOULD_CAPTURE) && !flags.contains(Flags::DID_CAPTURE) {
                    return Some(self.flip_capture(wip));
                }
            }
            FiberKind::HostComponent(_) => self.pop_host_context(),
            FiberKind::Suspense => {
                self.pop_suspense_context();
                if flags.contains(Flags::SHOULD_CAPTURE) {
                    return Some(self.flip_capture(wip));
                }
            }
            FiberKind::SuspenseList(_) => self.pop_suspense_context(),
            FiberKind::HostPortal(_) => self.pop_host_container(),
            FiberKind::Provider(_) => self.session.contexts.pop(),
            FiberKind::Offscreen => self.pop_render_lanes(),
            _ => {}
        }
        None
    }

    fn flip_capture(&mut self, wip: FiberId) -> FiberId {
        let f = &mut self.fibers[wip];
        f.flags = (f.flags - Flags::SHOULD_CAPTURE) | Flags::DID_CAPTURE;
        tracing::trace!(target: "fibra.complete", fiber = ?f.kind, "boundary captured; rendering again");
        wip
    }
}
