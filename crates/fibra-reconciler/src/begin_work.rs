#![forbid(unsafe_code)]

//! Begin phase: render one fiber and reconcile its children.
//!
//! A fiber whose props object is unchanged and which has no work in the
//! render lanes bails out early: it pushes whatever context its kind owns
//! (so completion stays balanced) and either skips its subtree or clones its
//! children for the descendants that do have work.
//!
//! # Invariants
//!
//! - `wip.lanes` is cleared before a fiber renders; lanes of skipped
//!   updates are put back by the queue or hook that skipped them.
//! - Every context push made here has a matching pop in `complete_work`
//!   and `unwind_work`.
//! - A function component whose state, props and context are unchanged
//!   keeps its committed effects and bails out after rendering.

use std::rc::Rc;

use fibra_core::{FiberId, Flags, HostConfig, Lanes, PortalId, ReconcilerError, Throw};

use crate::component::{FunctionComponent, LazyComponent, MemoComponent};
use crate::context::{ContextDef, ContextDependency, Dependencies};
use crate::element::{same_ref, Element, ElementType, PropsExtra};
use crate::fiber::{FiberKind, FiberQueue, MemoState, StateNode};
use crate::hooks::{FunctionQueue, HookEnv, HookPhase, Hooks};
use crate::reconciler::Reconciler;
use crate::throw::{call_user, WorkError};
use crate::update_queue::RootState;

type BeginResult = Result<Option<FiberId>, WorkError>;

impl<H: HostConfig> Reconciler<H> {
    /// Render `wip` and return its first child to work on next, if any.
    pub(crate) fn begin_work(&mut self, current: Option<FiberId>, wip: FiberId, render_lanes: Lanes) -> BeginResult {
        if let Some(cur) = current {
            let unchanged = self.fibers[cur]
                .memoized_props
                .as_ref()
                .is_some_and(|p| p.ptr_eq(&self.fibers[wip].pending_props));
            if !unchanged {
                self.session.did_receive_update = true;
            } else if !self.fibers[cur].lanes.includes_some(render_lanes)
                && !self.fibers[wip].flags.contains(Flags::DID_CAPTURE)
            {
                self.session.did_receive_update = false;
                return Ok(self.attempt_early_bailout(cur, wip, render_lanes));
            } else {
                self.session.did_receive_update = false;
            }
        } else {
            self.session.did_receive_update = false;
        }

        self.fibers[wip].lanes = Lanes::NONE;
        let kind = self.fibers[wip].kind.clone();
        tracing::trace!(
            target: "fibra.begin",
            fiber = ?kind,
            lanes = %render_lanes,
            mount = current.is_none(),
            "begin work"
        );
        self.begin_kind(current, wip, kind, render_lanes)
    }

    fn begin_kind(&mut self, current: Option<FiberId>, wip: FiberId, kind: FiberKind, lanes: Lanes) -> BeginResult {
        match kind {
            FiberKind::HostRoot => self.update_host_root(current, wip, lanes),
            FiberKind::HostComponent(ty) => Ok(self.update_host_component(current, wip, &ty, lanes)),
            FiberKind::HostText => Ok(None),
            FiberKind::HostPortal(portal) => self.update_portal_component(current, wip, portal, lanes),
            FiberKind::Fragment => Ok(self.update_fragment(current, wip, lanes)),
            FiberKind::Function(component) => self.update_function_component(current, wip, &component, lanes),
            FiberKind::Class(def) => self.update_class_component(current, wip, &def, lanes),
            FiberKind::Memo(memo) => self.update_memo_component(current, wip, &memo, lanes),
            FiberKind::Lazy(lazy) => self.mount_lazy_component(current, wip, &lazy, lanes),
            FiberKind::Provider(def) => Ok(self.update_context_provider(current, wip, &def, lanes)),
            FiberKind::Consumer(def) => self.update_context_consumer(current, wip, &def, lanes),
            FiberKind::Suspense => Ok(self.update_suspense_component(current, wip, lanes)),
            FiberKind::SuspenseList(_) => Ok(self.update_suspense_list_component(current, wip, lanes)),
            FiberKind::Offscreen => Ok(self.update_offscreen_component(current, wip, lanes)),
            FiberKind::Profiler(_) => Ok(self.update_profiler(current, wip, lanes)),
        }
    }

    // -- bailout ------------------------------------------------------------

    /// Nothing to do on `wip` itself; keep context balanced and skip or
    /// clone its children.
    fn attempt_early_bailout(&mut self, current: FiberId, wip: FiberId, render_lanes: Lanes) -> Option<FiberId> {
        match self.fibers[wip].kind.clone() {
            FiberKind::HostRoot => {
                if let StateNode::Root(root) = self.fibers[wip].state_node
                    && let Some(r) = self.roots.get(root)
                {
                    let container = r.container.clone();
                    self.push_host_container(container);
                }
            }
            FiberKind::HostComponent(ty) => self.push_host_context(&ty),
            FiberKind::HostPortal(portal) => {
                if let Some(container) = self.portals.get(portal).cloned() {
                    self.push_host_container(container);
                }
            }
            FiberKind::Provider(def) => {
                let value = self.fibers[wip]
                    .pending_props
                    .context_value()
                    .cloned()
                    .unwrap_or_else(|| def.default_value().clone());
                self.session.contexts.push(&def, value);
            }
            FiberKind::Profiler(_) => {
                if self.config.profiling && render_lanes.includes_some(self.fibers[wip].child_lanes) {
                    self.fibers[wip].flags |= Flags::UPDATE;
                }
            }
            FiberKind::Suspense => {
                if matches!(self.fibers[wip].memoized_state, MemoState::SuspenseFallback) {
                    let primary_lanes = self.fibers[wip]
                        .child
                        .map_or(Lanes::NONE, |primary| self.fibers[primary].child_lanes);
                    if render_lanes.includes_some(primary_lanes) {
                        // The hidden primary tree has work; try it again.
                        return self.update_suspense_component(Some(current), wip, render_lanes);
                    }
                    self.push_default_suspense_context();
                    let primary = self.bailout_on_already_finished_work(Some(current), wip, render_lanes);
                    // Skip the primary tree; only the fallback can have work.
                    return primary.and_then(|p| self.fibers[p].sibling);
                }
                self.push_default_suspense_context();
            }
            FiberKind::SuspenseList(_) => {
                let did_suspend_before = self.fibers[current].flags.contains(Flags::DID_CAPTURE);
                let has_child_work = render_lanes.includes_some(self.fibers[wip].child_lanes);
                if did_suspend_before {
                    if has_child_work {
                        return self.update_suspense_list_component(Some(current), wip, render_lanes);
                    }
                    self.fibers[wip].flags |= Flags::DID_CAPTURE;
                }
                if let MemoState::SuspenseList(state) = &mut self.fibers[wip].memoized_state {
                    state.rendering = None;
                    state.tail = None;
                    state.last = None;
                }
                let ctx = self.session.suspense_context;
                self.push_suspense_context(ctx);
                if !has_child_work {
                    return None;
                }
            }
            FiberKind::Offscreen => {
                // A hidden tree may still need deferring.
                self.fibers[wip].lanes = Lanes::NONE;
                return self.update_offscreen_component(Some(current), wip, render_lanes);
            }
            _ => {}
        }
        self.bailout_on_already_finished_work(Some(current), wip, render_lanes)
    }

    /// Skip rendering `wip`; returns cloned children if any of them has work.
    pub(crate) fn bailout_on_already_finished_work(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        if let Some(cur) = current {
            self.fibers[wip].dependencies = self.fibers[cur].dependencies.clone();
        }
        self.session.skipped_lanes |= self.fibers[wip].lanes;
        if !render_lanes.includes_some(self.fibers[wip].child_lanes) {
            tracing::trace!(target: "fibra.begin", fiber = ?self.fibers[wip].kind, "subtree bailout");
            return None;
        }
        self.clone_child_fibers(wip);
        self.fibers[wip].child
    }

    // -- host ---------------------------------------------------------------

    fn update_host_root(&mut self, current: Option<FiberId>, wip: FiberId, render_lanes: Lanes) -> BeginResult {
        let StateNode::Root(root) = self.fibers[wip].state_node else {
            return Err(ReconcilerError::UnknownRoot.into());
        };
        let container = self
            .roots
            .get(root)
            .ok_or(ReconcilerError::UnknownRoot)?
            .container
            .clone();
        self.push_host_container(container);

        let prev_element = match &self.fibers[wip].memoized_state {
            MemoState::Root(state) => state.element.clone(),
            _ => None,
        };
        let props = self.fibers[wip].pending_props.clone();
        let next = self
            .process_update_queue::<RootState>(wip, &props, render_lanes)
            .map(|p| p.state)
            .unwrap_or_default();
        self.fibers[wip].memoized_state = MemoState::Root(next.clone());

        let unchanged = match (&next.element, &prev_element) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        if unchanged && current.is_some_and(|c| self.fibers[c].child.is_some()) {
            return Ok(self.bailout_on_already_finished_work(current, wip, render_lanes));
        }
        let children: Vec<Element> = next.element.into_iter().collect();
        self.reconcile_children(current, wip, &children, render_lanes);
        Ok(self.fibers[wip].child)
    }

    fn update_host_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        ty: &Rc<str>,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        self.push_host_context(ty);
        let props = self.fibers[wip].pending_props.clone();
        let direct_text = self.host.should_set_text_content(ty, props.attrs());
        let had_direct_text = self.fibers[wip]
            .memoized_props
            .as_ref()
            .is_some_and(|prev| self.host.should_set_text_content(ty, prev.attrs()));
        if !direct_text && had_direct_text {
            self.fibers[wip].flags |= Flags::CONTENT_RESET;
        }
        self.mark_ref(current, wip);
        let children: &[Element] = if direct_text { &[] } else { props.children() };
        self.reconcile_children(current, wip, children, render_lanes);
        self.fibers[wip].child
    }

    fn mark_ref(&mut self, current: Option<FiberId>, wip: FiberId) {
        let next = self.fibers[wip].ref_.as_ref();
        let changed = match current {
            None => next.is_some(),
            Some(cur) => !same_ref(self.fibers[cur].ref_.as_ref(), next),
        };
        if changed {
            self.fibers[wip].flags |= Flags::REF | Flags::REF_STATIC;
        }
    }

    fn update_portal_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        portal: PortalId,
        render_lanes: Lanes,
    ) -> BeginResult {
        let container = self
            .portals
            .get(portal)
            .cloned()
            .ok_or_else(|| ReconcilerError::UnsupportedKind(format!("portal {portal:?} is not registered")))?;
        self.push_host_container(container);
        let props = self.fibers[wip].pending_props.clone();
        if current.is_some() {
            self.reconcile_children(current, wip, props.children(), render_lanes);
        } else {
            // Portal children are inserted at commit, never appended during completion.
            let child = self.reconcile_child_fibers(wip, None, props.children(), render_lanes, true);
            self.fibers[wip].child = child;
        }
        Ok(self.fibers[wip].child)
    }

    fn update_fragment(&mut self, current: Option<FiberId>, wip: FiberId, render_lanes: Lanes) -> Option<FiberId> {
        let props = self.fibers[wip].pending_props.clone();
        self.reconcile_children(current, wip, props.children(), render_lanes);
        self.fibers[wip].child
    }

    fn update_profiler(&mut self, current: Option<FiberId>, wip: FiberId, render_lanes: Lanes) -> Option<FiberId> {
        if self.config.profiling {
            self.fibers[wip].flags |= Flags::UPDATE;
        }
        self.update_fragment(current, wip, render_lanes)
    }

    // -- function components ------------------------------------------------

    fn prepare_to_read_context(&mut self, wip: FiberId, render_lanes: Lanes) {
        if let Some(deps) = &self.fibers[wip].dependencies
            && !deps.contexts.is_empty()
            && deps.lanes.includes_some(render_lanes)
        {
            self.session.did_receive_update = true;
        }
    }

    fn update_function_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        component: &Rc<FunctionComponent>,
        render_lanes: Lanes,
    ) -> BeginResult {
        self.prepare_to_read_context(wip, render_lanes);
        let element = self.render_with_hooks(current, wip, component, render_lanes)?;
        if let Some(cur) = current
            && !self.session.did_receive_update
        {
            self.bailout_hooks(cur, wip, render_lanes);
            return Ok(self.bailout_on_already_finished_work(current, wip, render_lanes));
        }
        self.fibers[wip].flags |= Flags::PERFORMED_WORK;
        self.reconcile_children(current, wip, std::slice::from_ref(&element), render_lanes);
        Ok(self.fibers[wip].child)
    }

    /// Keep the committed effects of a component that rendered the same output.
    fn bailout_hooks(&mut self, current: FiberId, wip: FiberId, render_lanes: Lanes) {
        let queue = self.fibers[current].update_queue.clone();
        let w = &mut self.fibers[wip];
        w.update_queue = queue;
        w.flags.remove(Flags::PASSIVE | Flags::UPDATE);
        let c = &mut self.fibers[current];
        c.lanes = c.lanes.remove(render_lanes);
    }

    /// Run a function component, repeating it while it schedules updates on
    /// itself during render.
    fn render_with_hooks(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        component: &Rc<FunctionComponent>,
        render_lanes: Lanes,
    ) -> Result<Element, WorkError> {
        let props = self.fibers[wip].pending_props.clone();
        let (mut phase, mut current_hooks) = match current.map(|c| &self.fibers[c].memoized_state) {
            Some(MemoState::Hooks(hooks)) => (HookPhase::Update, hooks.clone()),
            _ => (HookPhase::Mount, Vec::new()),
        };
        let mut previous = Vec::new();
        let mut dirty = false;
        let mut passes = 0u32;
        let blocking = self.includes_blocking_lane(self.session.render_lanes);
        let mode = self.fibers[wip].mode;
        let name = component.name().to_string();

        loop {
            self.shared.begin_component_render(wip, current);
            let env = HookEnv {
                component: &name,
                shared: &self.shared,
                contexts: &self.session.contexts,
                fiber: wip,
                mode,
                render_lanes,
                blocking,
            };
            let mut hooks = Hooks::new(&env, phase, current_hooks, previous);
            let result = call_user(|| component.call(&props, &mut hooks));
            let output = hooks.finish();
            let rerender = self.shared.take_render_phase_update();
            self.shared.end_component_render();
            dirty |= output.current_dirty;

            let element = match result {
                Ok(element) => element,
                Err(err) => {
                    if rerender {
                        output.discard_render_phase_updates();
                    }
                    if dirty && let Some(cur) = current {
                        self.fibers[cur].memoized_state = MemoState::Hooks(output.current);
                    }
                    return Err(err);
                }
            };

            if rerender {
                passes += 1;
                if passes >= self.config.rerender_limit {
                    output.discard_render_phase_updates();
                    if dirty && let Some(cur) = current {
                        self.fibers[cur].memoized_state = MemoState::Hooks(output.current);
                    }
                    return Err(Throw::error(format!(
                        "`{name}` re-rendered {passes} times; a state update during render keeps scheduling another"
                    ))
                    .into());
                }
                tracing::trace!(target: "fibra.hooks", component = %name, pass = passes, "render-phase update; rendering again");
                current_hooks = output.current;
                previous = output.hooks;
                phase = HookPhase::Rerender;
                continue;
            }

            if output.missing {
                return Err(ReconcilerError::TooFewHooks { component: name }.into());
            }
            if dirty && let Some(cur) = current {
                self.fibers[cur].memoized_state = MemoState::Hooks(output.current);
            }
            self.session.skipped_lanes |= output.skipped_lanes;
            self.session.did_receive_update |= output.did_receive_update;
            let f = &mut self.fibers[wip];
            f.memoized_state = MemoState::Hooks(output.hooks);
            f.update_queue = FiberQueue::Function(FunctionQueue {
                effects: output.effects,
                stores: output.stores,
            });
            f.flags |= output.flags;
            f.lanes |= output.lanes;
            f.dependencies = (!output.dependencies.is_empty()).then(|| Dependencies {
                lanes: Lanes::NONE,
                contexts: output.dependencies,
            });
            return Ok(element);
        }
    }

    // -- memo and lazy ------------------------------------------------------

    fn update_memo_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        memo: &Rc<MemoComponent>,
        render_lanes: Lanes,
    ) -> BeginResult {
        if let ElementType::Function(inner) = memo.inner()
            && !memo.has_custom_compare()
        {
            return self.update_simple_memo_component(current, wip, memo, &inner.clone(), render_lanes);
        }
        let props = self.fibers[wip].pending_props.clone();
        if let Some(cur) = current
            && !self.fibers[cur].lanes.includes_some(render_lanes)
        {
            let prev = self.fibers[cur].memoized_props.clone().unwrap_or_default();
            let equal = call_user(|| Ok(memo.props_equal(&prev, &props)))?;
            if equal && same_ref(self.fibers[cur].ref_.as_ref(), self.fibers[wip].ref_.as_ref()) {
                return Ok(self.bailout_on_already_finished_work(current, wip, render_lanes));
            }
        }
        self.fibers[wip].flags |= Flags::PERFORMED_WORK;
        let child = Element {
            ty: memo.inner().clone(),
            key: None,
            ref_: self.fibers[wip].ref_.clone(),
            props,
        };
        self.reconcile_children(current, wip, std::slice::from_ref(&child), render_lanes);
        Ok(self.fibers[wip].child)
    }

    /// Memo around a plain function with shallow comparison: the memo fiber
    /// renders the function itself.
    fn update_simple_memo_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        memo: &Rc<MemoComponent>,
        inner: &Rc<FunctionComponent>,
        render_lanes: Lanes,
    ) -> BeginResult {
        if let Some(cur) = current {
            let prev = self.fibers[cur].memoized_props.clone().unwrap_or_default();
            let next = self.fibers[wip].pending_props.clone();
            let same_ref_ = same_ref(self.fibers[cur].ref_.as_ref(), self.fibers[wip].ref_.as_ref());
            if same_ref_ && memo.props_equal(&prev, &next) {
                self.session.did_receive_update = false;
                // Keep the committed props object so later identity checks hold.
                self.fibers[wip].pending_props = prev;
                if !self.fibers[cur].lanes.includes_some(render_lanes) {
                    self.fibers[wip].lanes = self.fibers[cur].lanes;
                    return Ok(self.bailout_on_already_finished_work(current, wip, render_lanes));
                }
            }
        }
        self.update_function_component(current, wip, inner, render_lanes)
    }

    fn mount_lazy_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        lazy: &Rc<LazyComponent>,
        render_lanes: Lanes,
    ) -> BeginResult {
        let resolved = call_user(|| lazy.resolve())?;
        let kind = FiberKind::from_type(&resolved);
        if matches!(kind, FiberKind::Lazy(_)) {
            return Err(Throw::error(format!("lazy `{}` resolved to another lazy component", lazy.name())).into());
        }
        tracing::trace!(target: "fibra.begin", component = lazy.name(), resolved = ?kind, "lazy component resolved");
        self.fibers[wip].kind = kind.clone();
        self.begin_kind(current, wip, kind, render_lanes)
    }

    // -- context ------------------------------------------------------------

    fn update_context_provider(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        def: &Rc<ContextDef>,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let props = self.fibers[wip].pending_props.clone();
        let value = props
            .context_value()
            .cloned()
            .unwrap_or_else(|| def.default_value().clone());
        self.session.contexts.push(def, value.clone());

        if current.is_some()
            && let Some(old) = self.fibers[wip].memoized_props.clone()
        {
            let old_value = old
                .context_value()
                .cloned()
                .unwrap_or_else(|| def.default_value().clone());
            if def.values_equal(&old_value, &value) {
                if old.same_children(&props) {
                    return self.bailout_on_already_finished_work(current, wip, render_lanes);
                }
            } else {
                self.propagate_context_change(wip, def, render_lanes);
            }
        }
        self.reconcile_children(current, wip, props.children(), render_lanes);
        self.fibers[wip].child
    }

    fn update_context_consumer(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        def: &Rc<ContextDef>,
        render_lanes: Lanes,
    ) -> BeginResult {
        self.prepare_to_read_context(wip, render_lanes);
        let props = self.fibers[wip].pending_props.clone();
        let PropsExtra::Consumer(render) = props.extra() else {
            return Err(Throw::error(format!("`{}.Consumer` has no render function", def.name())).into());
        };
        let value = self.session.contexts.read(def);
        let element = call_user(|| Ok(render(value.as_ref())))?;
        let f = &mut self.fibers[wip];
        f.dependencies = Some(Dependencies {
            lanes: Lanes::NONE,
            contexts: vec![ContextDependency { def: def.clone(), value }],
        });
        f.flags |= Flags::PERFORMED_WORK;
        self.reconcile_children(current, wip, std::slice::from_ref(&element), render_lanes);
        Ok(self.fibers[wip].child)
    }
}
