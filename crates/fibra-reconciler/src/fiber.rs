#![forbid(unsafe_code)]

//! Fiber arena records and the double-buffering primitives.
//!
//! Every fiber lives in a `SlotMap<FiberId, Fiber>` owned by the reconciler.
//! Tree links (`return_`, `child`, `sibling`) and the `alternate` pairing are
//! plain ids, so both trees share one arena and no fiber is ever aliased
//! mutably.
//!
//! # Invariants
//!
//! - `a.alternate == Some(b)` implies `b.alternate == Some(a)`.
//! - `create_work_in_progress` keeps only static flags and clears
//!   `subtree_flags` and `deletions`.
//! - Host nodes are shared by both alternates through one `HostNodeId`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashSet;
use fibra_core::{
    CallbackHandle, FiberId, Flags, HostConfig, HostNodeId, Lanes, Mode, NO_TIMESTAMP, PortalId,
    RootId, RootLanes, Timestamp,
};

use crate::class_component::ClassInstance;
use crate::component::{ClassDef, ClassState, FunctionComponent, LazyComponent, MemoComponent, ProfilerDef};
use crate::context::{ContextDef, Dependencies};
use crate::element::{Element, ElementType, Key, Props, RefObject, SuspenseListConfig};
use crate::hooks::{FunctionQueue, Hook};
use crate::reconciler::Reconciler;
use crate::suspense::{ListRenderState, OffscreenState};
use crate::update_queue::{CapturedError, RootState, UpdateQueue};

/// Resolved kind of a fiber.
#[derive(Clone)]
pub(crate) enum FiberKind {
    HostRoot,
    HostPortal(PortalId),
    HostComponent(Rc<str>),
    HostText,
    Fragment,
    Function(Rc<FunctionComponent>),
    Class(Rc<ClassDef>),
    Provider(Rc<ContextDef>),
    Consumer(Rc<ContextDef>),
    Memo(Rc<MemoComponent>),
    Lazy(Rc<LazyComponent>),
    Suspense,
    SuspenseList(SuspenseListConfig),
    Offscreen,
    Profiler(Rc<ProfilerDef>),
}

impl FiberKind {
    pub(crate) fn from_type(ty: &ElementType) -> Self {
        match ty {
            ElementType::Host(t) => Self::HostComponent(t.clone()),
            ElementType::Text => Self::HostText,
            ElementType::Function(f) => Self::Function(f.clone()),
            ElementType::Class(c) => Self::Class(c.clone()),
            ElementType::Memo(m) => Self::Memo(m.clone()),
            ElementType::Lazy(l) => Self::Lazy(l.clone()),
            ElementType::Fragment => Self::Fragment,
            ElementType::Provider(c) => Self::Provider(c.clone()),
            ElementType::Consumer(c) => Self::Consumer(c.clone()),
            ElementType::Suspense => Self::Suspense,
            ElementType::SuspenseList(cfg) => Self::SuspenseList(*cfg),
            ElementType::Portal(p) => Self::HostPortal(*p),
            ElementType::Offscreen => Self::Offscreen,
            ElementType::Profiler(p) => Self::Profiler(p.clone()),
        }
    }

    #[must_use]
    pub(crate) fn name(&self) -> String {
        match self {
            Self::HostRoot => "HostRoot".into(),
            Self::HostPortal(_) => "Portal".into(),
            Self::HostComponent(t) => t.to_string(),
            Self::HostText => "#text".into(),
            Self::Fragment => "Fragment".into(),
            Self::Function(f) => f.name().to_string(),
            Self::Class(c) => c.name().to_string(),
            Self::Provider(c) => format!("{}.Provider", c.name()),
            Self::Consumer(c) => format!("{}.Consumer", c.name()),
            Self::Memo(m) => format!("Memo({})", m.inner().name()),
            Self::Lazy(l) => format!("Lazy({})", l.name()),
            Self::Suspense => "Suspense".into(),
            Self::SuspenseList(_) => "SuspenseList".into(),
            Self::Offscreen => "Offscreen".into(),
            Self::Profiler(p) => format!("Profiler({})", p.id()),
        }
    }

    /// Kinds that own a host node.
    pub(crate) fn is_host(&self) -> bool {
        matches!(self, Self::HostComponent(_) | Self::HostText)
    }

    /// Kinds that can be a host parent for placement.
    pub(crate) fn is_host_parent(&self) -> bool {
        matches!(self, Self::HostComponent(_) | Self::HostRoot | Self::HostPortal(_))
    }

    /// Kinds shown in component stacks.
    pub(crate) fn is_component(&self) -> bool {
        matches!(
            self,
            Self::Function(_) | Self::Class(_) | Self::Memo(_) | Self::Lazy(_) | Self::Suspense | Self::SuspenseList(_)
        )
    }
}

impl fmt::Debug for FiberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Memoized state, by fiber kind.
#[derive(Clone, Default)]
pub(crate) enum MemoState {
    #[default]
    None,
    Hooks(Vec<Hook>),
    Class(ClassState),
    Root(RootState),
    /// A suspense boundary currently showing its fallback.
    SuspenseFallback,
    Offscreen(OffscreenState),
    SuspenseList(ListRenderState),
}

impl MemoState {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Pending work attached to a fiber, by fiber kind.
#[derive(Clone, Default)]
pub(crate) enum FiberQueue {
    #[default]
    None,
    Root(UpdateQueue<RootState>),
    Class(UpdateQueue<ClassState>),
    Function(FunctionQueue),
    /// Wakeables a suspense boundary or list retries on.
    Retry(Vec<fibra_core::Wakeable>),
}

/// Instance bound to a fiber.
#[derive(Clone, Default)]
pub(crate) enum StateNode {
    #[default]
    None,
    Root(RootId),
    Host(HostNodeId),
    Class(Rc<RefCell<ClassInstance>>),
    /// Suspense boundary retry cache of wakeable ids.
    RetryCache(Rc<RefCell<AHashSet<u64>>>),
}

impl StateNode {
    pub(crate) fn host(&self) -> Option<HostNodeId> {
        match self {
            Self::Host(id) => Some(*id),
            _ => None,
        }
    }
}

/// One unit of work.
#[derive(Clone)]
pub(crate) struct Fiber {
    pub(crate) kind: FiberKind,
    pub(crate) element_type: Option<ElementType>,
    pub(crate) key: Option<Key>,
    pub(crate) ref_: Option<RefObject>,

    pub(crate) pending_props: Props,
    pub(crate) memoized_props: Option<Props>,
    pub(crate) memoized_state: MemoState,
    pub(crate) update_queue: FiberQueue,
    pub(crate) dependencies: Option<Dependencies>,
    pub(crate) state_node: StateNode,
    pub(crate) mode: Mode,

    pub(crate) flags: Flags,
    pub(crate) subtree_flags: Flags,
    pub(crate) deletions: Vec<FiberId>,

    pub(crate) lanes: Lanes,
    pub(crate) child_lanes: Lanes,

    pub(crate) return_: Option<FiberId>,
    pub(crate) child: Option<FiberId>,
    pub(crate) sibling: Option<FiberId>,
    pub(crate) index: usize,
    pub(crate) alternate: Option<FiberId>,

    pub(crate) actual_start_time: Timestamp,
    pub(crate) actual_duration: Timestamp,
}

impl Fiber {
    pub(crate) fn new(kind: FiberKind, element_type: Option<ElementType>, key: Option<Key>, props: Props, mode: Mode) -> Self {
        Self {
            kind,
            element_type,
            key,
            ref_: None,
            pending_props: props,
            memoized_props: None,
            memoized_state: MemoState::None,
            update_queue: FiberQueue::None,
            dependencies: None,
            state_node: StateNode::None,
            mode,
            flags: Flags::empty(),
            subtree_flags: Flags::empty(),
            deletions: Vec::new(),
            lanes: Lanes::NONE,
            child_lanes: Lanes::NONE,
            return_: None,
            child: None,
            sibling: None,
            index: 0,
            alternate: None,
            actual_start_time: NO_TIMESTAMP,
            actual_duration: 0,
        }
    }

    pub(crate) fn from_element(element: &Element, mode: Mode, lanes: Lanes) -> Self {
        let mut fiber = Self::new(
            FiberKind::from_type(&element.ty),
            Some(element.ty.clone()),
            element.key.clone(),
            element.props.clone(),
            mode,
        );
        fiber.ref_ = element.ref_.clone();
        fiber.lanes = lanes;
        fiber
    }

    pub(crate) fn is_concurrent(&self) -> bool {
        self.mode.contains(Mode::CONCURRENT)
    }

    /// Props comparison used for bailout: identity of the props object.
    pub(crate) fn props_unchanged(&self, next: &Props) -> bool {
        self.memoized_props.as_ref().is_some_and(|p| p.ptr_eq(next))
    }
}

/// Root tag selected at container creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootTag {
    /// Every update is synchronous.
    Legacy,
    /// Lanes, time slicing and transitions.
    Concurrent,
}

/// Per-container root record.
pub(crate) struct FiberRoot<H: HostConfig> {
    pub(crate) tag: RootTag,
    pub(crate) container: H::Container,
    pub(crate) current: FiberId,
    pub(crate) lanes: RootLanes,
    pub(crate) callback_node: Option<CallbackHandle>,
    pub(crate) callback_priority: Lanes,
    pub(crate) finished_work: Option<FiberId>,
    pub(crate) finished_lanes: Lanes,
    pub(crate) timeout_handle: Option<CallbackHandle>,
    /// Wakeable id to lanes a ping listener is already attached for.
    pub(crate) ping_cache: ahash::AHashMap<u64, Lanes>,
    /// Errors recovered from while rendering `finished_work`.
    pub(crate) recoverable_errors: Vec<CapturedError>,
}

impl<H: HostConfig> FiberRoot<H> {
    pub(crate) fn is_concurrent(&self) -> bool {
        self.tag == RootTag::Concurrent
    }
}

// ---------------------------------------------------------------------------
// Arena operations
// ---------------------------------------------------------------------------

impl<H: HostConfig> Reconciler<H> {
    /// Create (or reset) the alternate of `current` for a new render.
    pub(crate) fn create_work_in_progress(&mut self, current: FiberId, pending_props: Props) -> FiberId {
        let cur = &self.fibers[current];
        let mut next = cur.clone();
        next.pending_props = pending_props;
        next.flags = cur.flags & Flags::STATIC_MASK;
        next.subtree_flags = Flags::empty();
        next.deletions = Vec::new();
        next.alternate = Some(current);
        next.actual_duration = 0;
        next.actual_start_time = NO_TIMESTAMP;
        match cur.alternate {
            Some(wip) => {
                // Reuse the slot; keep the wip's own return pointer.
                next.return_ = self.fibers[wip].return_;
                self.fibers[wip] = next;
                self.host_payloads.remove(wip);
                wip
            }
            None => {
                next.return_ = None;
                let wip = self.fibers.insert(next);
                self.fibers[current].alternate = Some(wip);
                wip
            }
        }
    }

    /// Reset a wip fiber back to its current state (used when a list tail
    /// is re-rendered from scratch).
    pub(crate) fn reset_work_in_progress(&mut self, wip: FiberId, render_lanes: Lanes) {
        let static_and_placement = Flags::STATIC_MASK | Flags::PLACEMENT;
        let current = self.fibers[wip].alternate;
        match current {
            None => {
                let f = &mut self.fibers[wip];
                f.flags &= static_and_placement;
                f.child_lanes = Lanes::NONE;
                f.lanes = render_lanes;
                f.child = None;
                f.subtree_flags = Flags::empty();
                f.memoized_props = None;
                f.memoized_state = MemoState::None;
                f.update_queue = FiberQueue::None;
                f.dependencies = None;
                f.state_node = StateNode::None;
            }
            Some(cur) => {
                let c = self.fibers[cur].clone();
                let f = &mut self.fibers[wip];
                f.flags &= static_and_placement;
                f.child_lanes = c.child_lanes;
                f.lanes = c.lanes;
                f.child = c.child;
                f.subtree_flags = Flags::empty();
                f.deletions.clear();
                f.memoized_props = c.memoized_props;
                f.memoized_state = c.memoized_state;
                f.update_queue = c.update_queue;
                f.dependencies = c.dependencies;
            }
        }
    }

    /// Children of `parent` in sibling order.
    pub(crate) fn children_of(&self, parent: FiberId) -> Vec<FiberId> {
        let mut out = Vec::new();
        let mut next = self.fibers[parent].child;
        while let Some(child) = next {
            out.push(child);
            next = self.fibers[child].sibling;
        }
        out
    }

    /// Component stack for error reports, innermost first.
    pub(crate) fn component_stack(&self, fiber: FiberId) -> String {
        let mut out = String::new();
        let mut next = Some(fiber);
        while let Some(id) = next {
            let Some(f) = self.fibers.get(id) else { break };
            if f.kind.is_component() || matches!(f.kind, FiberKind::HostComponent(_)) {
                out.push_str("\n    in ");
                out.push_str(&f.kind.name());
            }
            next = f.return_;
        }
        out
    }

    /// Drop fibers unreachable from any root.
    ///
    /// Marks the current tree of every root, the alternates of marked fibers,
    /// pending deletions and unfinished commits; everything else is swept,
    /// along with host nodes only swept fibers referenced.
    pub(crate) fn collect_garbage(&mut self) {
        let mut live: AHashSet<FiberId> = AHashSet::with_capacity(self.fibers.len());
        let mut stack: Vec<FiberId> = Vec::new();
        for (_, root) in &self.roots {
            stack.push(root.current);
            if let Some(finished) = root.finished_work {
                stack.push(finished);
            }
        }
        while let Some(id) = stack.pop() {
            let Some(f) = self.fibers.get(id) else { continue };
            if !live.insert(id) {
                continue;
            }
            if let Some(alt) = f.alternate {
                live.insert(alt);
            }
            stack.extend(f.deletions.iter().copied());
            if let Some(c) = f.child {
                stack.push(c);
            }
            if let Some(s) = f.sibling {
                stack.push(s);
            }
        }
        // Deleted subtrees awaiting passive cleanup stay alive with their children.
        let pending: Vec<FiberId> = live
            .iter()
            .filter_map(|id| self.fibers.get(*id))
            .flat_map(|f| f.deletions.iter().copied())
            .collect();
        for id in pending {
            self.mark_subtree(id, &mut live);
        }

        let before = self.fibers.len();
        self.fibers.retain(|id, _| live.contains(&id));
        let host_live: AHashSet<HostNodeId> = self
            .fibers
            .values()
            .filter_map(|f| f.state_node.host())
            .collect();
        self.host_nodes.retain(|id, _| host_live.contains(&id));
        let fibers = &self.fibers;
        self.host_payloads.retain(|id, _| fibers.contains_key(id));
        for f in self.fibers.values_mut() {
            if f.alternate.is_some_and(|a| !live.contains(&a)) {
                f.alternate = None;
            }
        }
        tracing::debug!(
            target: "fibra.work_loop",
            swept = before - self.fibers.len(),
            live = self.fibers.len(),
            "collected unreachable fibers"
        );
    }

    fn mark_subtree(&self, root: FiberId, live: &mut AHashSet<FiberId>) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(f) = self.fibers.get(id) else { continue };
            live.insert(id);
            if let Some(alt) = f.alternate {
                live.insert(alt);
            }
            if let Some(c) = f.child {
                stack.push(c);
            }
            if id != root
                && let Some(s) = f.sibling
            {
                stack.push(s);
            }
        }
    }

    /// Remove a fully unmounted subtree and its alternates from the arena.
    pub(crate) fn detach_deleted_subtree(&mut self, root: FiberId) {
        let mut stack = vec![root];
        let mut doomed = Vec::new();
        while let Some(id) = stack.pop() {
            let Some(f) = self.fibers.get(id) else { continue };
            doomed.push(id);
            if let Some(alt) = f.alternate {
                doomed.push(alt);
            }
            if let Some(c) = f.child {
                stack.push(c);
            }
            if id != root
                && let Some(s) = f.sibling
            {
                stack.push(s);
            }
        }
        for id in doomed {
            if let Some(f) = self.fibers.remove(id)
                && let Some(node) = f.state_node.host()
            {
                self.host_nodes.remove(node);
            }
            self.host_payloads.remove(id);
        }
    }
}
