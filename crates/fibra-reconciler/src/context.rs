#![forbid(unsafe_code)]

//! Context values and change propagation.
//!
//! Providers push their value onto [`ContextStack`] on the way down and pop
//! it on the way up, so a consumer always reads the nearest provider. A
//! provider whose value changed walks its subtree and schedules every fiber
//! that recorded a dependency on it.
//!
//! # Invariants
//!
//! - Push and pop are strictly nested per fiber.
//! - Dependencies are recorded per render and replace the previous list.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use fibra_core::{FiberId, HostConfig, Lanes};

use crate::element::Element;
use crate::fiber::{FiberKind, MemoState};
use crate::reconciler::Reconciler;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type EqFn = fn(&dyn Any, &dyn Any) -> bool;

fn eq_any<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Type-erased context definition.
pub struct ContextDef {
    id: u64,
    name: String,
    default: Rc<dyn Any>,
    eq: EqFn,
}

impl ContextDef {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn default_value(&self) -> &Rc<dyn Any> {
        &self.default
    }

    pub(crate) fn values_equal(&self, a: &Rc<dyn Any>, b: &Rc<dyn Any>) -> bool {
        Rc::ptr_eq(a, b) || (self.eq)(a.as_ref(), b.as_ref())
    }
}

/// Typed handle to a context.
pub struct Context<T> {
    def: Rc<ContextDef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: PartialEq + 'static> Context<T> {
    pub fn new(name: impl Into<String>, default: T) -> Self {
        Self {
            def: Rc::new(ContextDef {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                default: Rc::new(default),
                eq: eq_any::<T>,
            }),
            _marker: PhantomData,
        }
    }

    /// Provide `value` to `children`.
    pub fn provider(&self, value: T, children: Vec<Element>) -> Element {
        Element::provider(self.def.clone(), Rc::new(value), children)
    }

    /// Render `render` with the nearest provided value.
    pub fn consumer(&self, render: impl Fn(&T) -> Element + 'static) -> Element {
        let name = self.def.name.clone();
        Element::consumer(
            self.def.clone(),
            Rc::new(move |value: &dyn Any| match value.downcast_ref::<T>() {
                Some(v) => render(v),
                None => {
                    tracing::warn!(target: "fibra.begin", context = %name, "context value has the wrong type");
                    Element::empty()
                }
            }),
        )
    }

    #[must_use]
    pub fn def(&self) -> &Rc<ContextDef> {
        &self.def
    }
}

/// A recorded read of a context during render.
#[derive(Clone)]
pub(crate) struct ContextDependency {
    pub(crate) def: Rc<ContextDef>,
    pub(crate) value: Rc<dyn Any>,
}

/// Contexts read by a fiber in its last render.
#[derive(Clone, Default)]
pub(crate) struct Dependencies {
    pub(crate) lanes: Lanes,
    pub(crate) contexts: Vec<ContextDependency>,
}

/// Provider values currently in scope.
#[derive(Default)]
pub(crate) struct ContextStack {
    entries: Vec<(u64, Rc<dyn Any>)>,
}

impl ContextStack {
    pub(crate) fn push(&mut self, def: &ContextDef, value: Rc<dyn Any>) {
        self.entries.push((def.id, value));
    }

    pub(crate) fn pop(&mut self) {
        self.entries.pop();
    }

    /// Nearest provided value, or the context default.
    pub(crate) fn read(&self, def: &ContextDef) -> Rc<dyn Any> {
        self.entries
            .iter()
            .rev()
            .find(|(id, _)| *id == def.id)
            .map_or_else(|| def.default.clone(), |(_, v)| v.clone())
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn depth(&self) -> usize {
        self.entries.len()
    }
}

impl<H: HostConfig> Reconciler<H> {
    /// True if any dependency recorded on `fiber` now reads a different value.
    pub(crate) fn check_if_context_changed(&self, fiber: FiberId) -> bool {
        let Some(deps) = &self.fibers[fiber].dependencies else {
            return false;
        };
        deps.contexts.iter().any(|dep| {
            let current = self.session.contexts.read(&dep.def);
            !dep.def.values_equal(&current, &dep.value)
        })
    }

    /// Schedule render lanes on every consumer of `def` below `provider`.
    ///
    /// Nested providers of the same context shadow it, so their subtrees are
    /// skipped.
    pub(crate) fn propagate_context_change(&mut self, provider: FiberId, def: &ContextDef, render_lanes: Lanes) {
        let mut next = self.fibers[provider].child;
        if let Some(child) = next {
            self.fibers[child].return_ = Some(provider);
        }
        let mut scheduled = 0usize;
        while let Some(fiber) = next {
            let depends = self.fibers[fiber]
                .dependencies
                .as_ref()
                .is_some_and(|d| d.contexts.iter().any(|c| c.def.id == def.id));
            let mut descend = true;
            if depends {
                self.schedule_context_work(fiber, render_lanes);
                scheduled += 1;
            } else if let FiberKind::Provider(nested) = &self.fibers[fiber].kind
                && nested.id == def.id
            {
                // Shadowed by a nearer provider of the same context.
                descend = false;
            }

            next = if descend { self.fibers[fiber].child } else { None };
            if let Some(child) = next {
                self.fibers[child].return_ = Some(fiber);
                continue;
            }
            // No children: walk to the next sibling, climbing as needed.
            let mut cursor = fiber;
            loop {
                if cursor == provider {
                    next = None;
                    break;
                }
                if let Some(sibling) = self.fibers[cursor].sibling {
                    self.fibers[sibling].return_ = self.fibers[cursor].return_;
                    next = Some(sibling);
                    break;
                }
                match self.fibers[cursor].return_ {
                    Some(parent) => cursor = parent,
                    None => {
                        next = None;
                        break;
                    }
                }
            }
        }
        tracing::trace!(
            target: "fibra.begin",
            context = %def.name,
            consumers = scheduled,
            "propagated context change"
        );
    }

    fn schedule_context_work(&mut self, fiber: FiberId, render_lanes: Lanes) {
        let lane = render_lanes.highest_priority_lane();
        let fiber_ref = &mut self.fibers[fiber];
        fiber_ref.lanes |= render_lanes;
        if let Some(deps) = fiber_ref.dependencies.as_mut() {
            deps.lanes |= render_lanes;
        }
        // Class consumers need a forced update so shouldComponentUpdate is skipped.
        if matches!(fiber_ref.kind, FiberKind::Class(_))
            && let MemoState::Class(_) = fiber_ref.memoized_state
        {
            self.force_class_update(fiber, lane);
        }
        if let Some(alt) = self.fibers[fiber].alternate {
            self.fibers[alt].lanes |= render_lanes;
        }
        let parent = self.fibers[fiber].return_;
        self.schedule_context_work_on_parent_path(parent, render_lanes);
    }

    /// Mark `child_lanes` from `parent` upward until an ancestor already has them.
    pub(crate) fn schedule_context_work_on_parent_path(&mut self, mut parent: Option<FiberId>, lanes: Lanes) {
        while let Some(node) = parent {
            let alt = self.fibers[node].alternate;
            let has = self.fibers[node].child_lanes.contains(lanes);
            let alt_has = alt.is_none_or(|a| self.fibers[a].child_lanes.contains(lanes));
            if has && alt_has {
                break;
            }
            self.fibers[node].child_lanes |= lanes;
            if let Some(a) = alt {
                self.fibers[a].child_lanes |= lanes;
            }
            parent = self.fibers[node].return_;
        }
    }
}
