#![forbid(unsafe_code)]

//! Hook state for function components.
//!
//! A function component renders with a [`Hooks`] cursor. Each `use_*` call
//! claims the next slot of the fiber's hook list; on update the slot must
//! hold a hook of the same kind as in the previous render.
//!
//! # Invariants
//!
//! - Hook order and count are stable across renders of one fiber. A kind
//!   mismatch or an extra hook aborts the render with an
//!   [`InvariantViolation`]; a missing hook is reported after the render
//!   function returns.
//! - State updates are processed in insertion order. Updates outside the
//!   render lanes are skipped and rebased exactly like class updates.
//! - Pending updates are moved into the base queue of *both* alternates, so
//!   an interrupted render loses nothing.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Hook kind changed | `ReconcilerError::HookOrder` (fatal) |
//! | More hooks than last render | `ReconcilerError::TooManyHooks` (fatal) |
//! | Fewer hooks than last render | `ReconcilerError::TooFewHooks` (fatal) |
//! | Setter called after unmount | Update is dropped |

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::panic_any;
use std::rc::{Rc, Weak};

use fibra_core::{
    EventPriority, FiberId, Flags, HookFlags, InvariantViolation, Lane, Lanes, Mode, ReconcilerError,
};

use crate::context::{Context, ContextDependency, ContextStack};
use crate::shared::{EagerCandidate, InboxEntry, Shared};
use crate::update_queue::ConcurrentQueue;

pub(crate) type AnyRc = Rc<dyn Any>;
pub(crate) type Reducer = Rc<dyn Fn(&AnyRc, &AnyRc) -> AnyRc>;
type EqFn = fn(&dyn Any, &dyn Any) -> bool;
type SnapshotFn = Rc<dyn Fn() -> AnyRc>;

fn eq_any<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Listener handed to an external store subscription.
pub type StoreListener = Rc<dyn Fn()>;

/// Subscribes a listener to an external store and returns its cleanup.
pub type Subscribe = Rc<dyn Fn(StoreListener) -> Cleanup>;

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Teardown returned by an effect.
#[derive(Default)]
pub struct Cleanup(Option<Box<dyn FnOnce()>>);

impl Cleanup {
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub(crate) fn into_inner(self) -> Option<Box<dyn FnOnce()>> {
        self.0
    }
}

/// Values an effect body may return.
pub trait IntoCleanup {
    fn into_cleanup(self) -> Cleanup;
}

impl IntoCleanup for () {
    fn into_cleanup(self) -> Cleanup {
        Cleanup::none()
    }
}

impl IntoCleanup for Cleanup {
    fn into_cleanup(self) -> Cleanup {
        self
    }
}

pub(crate) type EffectCreate = Box<dyn FnOnce() -> Cleanup>;

/// Teardown slot shared by every render of one effect hook.
#[derive(Default)]
pub(crate) struct EffectInstance {
    pub(crate) destroy: RefCell<Option<Box<dyn FnOnce()>>>,
}

pub(crate) struct Effect {
    pub(crate) tag: HookFlags,
    pub(crate) create: RefCell<Option<EffectCreate>>,
    pub(crate) inst: Rc<EffectInstance>,
    pub(crate) deps: Option<Deps>,
}

/// Type-erased dependency list.
///
/// The whole value is compared with `PartialEq` against the previous
/// render's, not element by element; a tuple of the inputs is the usual
/// shape. A value of a different type never compares equal.
#[derive(Clone)]
pub(crate) struct Deps {
    value: AnyRc,
    eq: EqFn,
}

impl Deps {
    fn of<D: PartialEq + 'static>(deps: D) -> Self {
        Self {
            value: Rc::new(deps),
            eq: eq_any::<D>,
        }
    }

    fn same(&self, other: &Deps) -> bool {
        (self.eq)(self.value.as_ref(), other.value.as_ref())
    }
}

fn deps_equal(next: Option<&Deps>, prev: Option<&Deps>) -> bool {
    match (next, prev) {
        (Some(a), Some(b)) => a.same(b),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// External stores
// ---------------------------------------------------------------------------

pub(crate) struct StoreInstance {
    value: RefCell<AnyRc>,
    get_snapshot: RefCell<SnapshotFn>,
    snapshot_id: Cell<usize>,
    eq: EqFn,
}

impl StoreInstance {
    fn changed(&self) -> bool {
        let latest = (self.get_snapshot.borrow())();
        !(self.eq)(latest.as_ref(), self.value.borrow().as_ref())
    }
}

/// Snapshot read during a concurrent render, re-checked before commit.
#[derive(Clone)]
pub(crate) struct StoreCheck {
    get_snapshot: SnapshotFn,
    value: AnyRc,
    eq: EqFn,
}

impl StoreCheck {
    pub(crate) fn is_consistent(&self) -> bool {
        let latest = (self.get_snapshot)();
        (self.eq)(latest.as_ref(), self.value.as_ref())
    }
}

/// Effects and store checks produced by the last render of a function fiber.
#[derive(Clone, Default)]
pub(crate) struct FunctionQueue {
    pub(crate) effects: Vec<Rc<Effect>>,
    pub(crate) stores: Vec<StoreCheck>,
}

// ---------------------------------------------------------------------------
// State queues
// ---------------------------------------------------------------------------

pub(crate) struct HookUpdate {
    pub(crate) lane: Lane,
    pub(crate) action: AnyRc,
    pub(crate) eager: RefCell<Option<AnyRc>>,
}

impl HookUpdate {
    fn rebased(&self) -> Rc<Self> {
        Rc::new(Self {
            lane: Lanes::NONE,
            action: self.action.clone(),
            eager: RefCell::new(self.eager.borrow().clone()),
        })
    }
}

/// Dispatch target shared by both alternates of a state hook.
pub(crate) struct HookQueue {
    pending: RefCell<Vec<Rc<HookUpdate>>>,
    interleaved: RefCell<Vec<Rc<HookUpdate>>>,
    lanes: Cell<Lanes>,
    pub(crate) last_rendered_reducer: RefCell<Reducer>,
    pub(crate) last_rendered_state: RefCell<AnyRc>,
    pub(crate) state_eq: EqFn,
    fiber: FiberId,
    mode: Mode,
    shared: Weak<Shared>,
}

impl HookQueue {
    fn dispatch(self: &Rc<Self>, action: AnyRc, eager: bool) {
        let Some(shared) = self.shared.upgrade() else {
            tracing::debug!(target: "fibra.hooks", "dropping update dispatched after the reconciler was dropped");
            return;
        };
        let lane = shared.request_update_lane(self.mode);
        let update = Rc::new(HookUpdate {
            lane,
            action,
            eager: RefCell::new(None),
        });
        if shared.is_rendering(self.fiber) {
            shared.mark_render_phase_update();
            self.pending.borrow_mut().push(update);
            return;
        }
        if shared.is_interleaved(self.mode) {
            self.interleaved.borrow_mut().push(update.clone());
            shared.register_interleaved(self.clone());
        } else {
            self.pending.borrow_mut().push(update.clone());
        }
        tracing::trace!(target: "fibra.hooks", lane = %lane, "state update dispatched");
        shared.post(InboxEntry::Update {
            fiber: self.fiber,
            lane,
            event_time: shared.now(),
            queue: self.clone(),
            eager: eager.then(|| EagerCandidate {
                queue: self.clone(),
                update,
            }),
        });
    }

    /// Drop render-phase updates left behind by a render that threw.
    fn clear_pending(&self) {
        self.pending.borrow_mut().clear();
    }
}

impl ConcurrentQueue for HookQueue {
    fn merge_interleaved(&self) {
        let moved = std::mem::take(&mut *self.interleaved.borrow_mut());
        self.pending.borrow_mut().extend(moved);
    }

    fn transition_lanes(&self) -> &Cell<Lanes> {
        &self.lanes
    }
}

enum StateAction<T> {
    Set(Rc<T>),
    Update(Rc<dyn Fn(&T) -> T>),
}

fn basic_state_reducer<T: 'static>(state: &AnyRc, action: &AnyRc) -> AnyRc {
    match action.downcast_ref::<StateAction<T>>() {
        Some(StateAction::Set(value)) => value.clone() as AnyRc,
        Some(StateAction::Update(f)) => match state.downcast_ref::<T>() {
            Some(prev) => Rc::new(f(prev)) as AnyRc,
            None => state.clone(),
        },
        None => state.clone(),
    }
}

/// Setter returned by [`Hooks::use_state`].
pub struct StateSetter<T> {
    queue: Rc<HookQueue>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for StateSetter<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> StateSetter<T> {
    pub fn set(&self, value: T) {
        self.queue
            .dispatch(Rc::new(StateAction::Set(Rc::new(value))), true);
    }

    /// Queue a functional update applied to the latest state.
    pub fn update(&self, f: impl Fn(&T) -> T + 'static) {
        self.queue
            .dispatch(Rc::new(StateAction::<T>::Update(Rc::new(f))), true);
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.queue, &other.queue)
    }
}

/// Dispatcher returned by [`Hooks::use_reducer`].
pub struct Dispatch<A> {
    queue: Rc<HookQueue>,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for Dispatch<A> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: 'static> Dispatch<A> {
    pub fn dispatch(&self, action: A) {
        self.queue.dispatch(Rc::new(action), false);
    }
}

/// Starts a transition; returned by [`Hooks::use_transition`].
#[derive(Clone)]
pub struct TransitionStarter {
    set_pending: StateSetter<bool>,
    shared: Weak<Shared>,
}

impl TransitionStarter {
    /// Mark pending at continuous priority, then run `f` as a transition.
    pub fn start(&self, f: impl FnOnce()) {
        let Some(shared) = self.shared.upgrade() else {
            f();
            return;
        };
        let scope = TransitionScope::enter(shared);
        let elevated = scope.prev_priority.map_or(EventPriority::Continuous, |p| {
            EventPriority::higher(p, EventPriority::Continuous)
        });
        scope.shared.set_update_priority(Some(elevated));
        self.set_pending.set(true);
        scope.shared.set_in_transition(true);
        self.set_pending.set(false);
        f();
    }
}

/// Restores the update priority and transition flag on drop, so a panic in
/// the transition body does not leave later updates on a transition lane.
struct TransitionScope {
    shared: Rc<Shared>,
    prev_priority: Option<EventPriority>,
    prev_transition: bool,
}

impl TransitionScope {
    fn enter(shared: Rc<Shared>) -> Self {
        Self {
            prev_priority: shared.update_priority(),
            prev_transition: shared.in_transition(),
            shared,
        }
    }
}

impl Drop for TransitionScope {
    fn drop(&mut self) {
        self.shared.set_update_priority(self.prev_priority);
        self.shared.set_in_transition(self.prev_transition);
    }
}

// ---------------------------------------------------------------------------
// Hook list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookKind {
    State,
    Reducer,
    Effect,
    LayoutEffect,
    InsertionEffect,
    Memo,
    Ref,
    Transition,
    DeferredValue,
    SyncExternalStore,
}

impl HookKind {
    fn name(self) -> &'static str {
        match self {
            Self::State => "use_state",
            Self::Reducer => "use_reducer",
            Self::Effect => "use_effect",
            Self::LayoutEffect => "use_layout_effect",
            Self::InsertionEffect => "use_insertion_effect",
            Self::Memo => "use_memo",
            Self::Ref => "use_ref",
            Self::Transition => "use_transition",
            Self::DeferredValue => "use_deferred_value",
            Self::SyncExternalStore => "use_sync_external_store",
        }
    }
}

#[derive(Clone)]
pub(crate) struct ReducerHook {
    memoized: AnyRc,
    base_state: AnyRc,
    base_queue: Vec<Rc<HookUpdate>>,
    queue: Rc<HookQueue>,
}

#[derive(Clone)]
pub(crate) enum HookState {
    Reducer(ReducerHook),
    Effect(Rc<Effect>),
    Memo { value: AnyRc, deps: Option<Deps> },
    Ref(AnyRc),
    Transition(TransitionStarter),
    Deferred { value: AnyRc, inconsistent: bool },
    Store { value: AnyRc, inst: Rc<StoreInstance> },
}

#[derive(Clone)]
pub(crate) struct Hook {
    pub(crate) kind: HookKind,
    pub(crate) state: HookState,
}

impl Hook {
    /// State queue of this hook, if it has one.
    pub(crate) fn queue(&self) -> Option<&Rc<HookQueue>> {
        match &self.state {
            HookState::Reducer(r) => Some(&r.queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookPhase {
    Mount,
    Update,
    Rerender,
}

/// Per-render environment of a function component.
pub(crate) struct HookEnv<'a> {
    pub(crate) component: &'a str,
    pub(crate) shared: &'a Rc<Shared>,
    pub(crate) contexts: &'a ContextStack,
    pub(crate) fiber: FiberId,
    pub(crate) mode: Mode,
    pub(crate) render_lanes: Lanes,
    /// Render lanes include a lane that is never time-sliced.
    pub(crate) blocking: bool,
}

/// Everything one render pass produced besides its children.
pub(crate) struct HookOutput {
    pub(crate) hooks: Vec<Hook>,
    pub(crate) current: Vec<Hook>,
    pub(crate) current_dirty: bool,
    pub(crate) effects: Vec<Rc<Effect>>,
    pub(crate) stores: Vec<StoreCheck>,
    pub(crate) flags: Flags,
    pub(crate) lanes: Lanes,
    pub(crate) skipped_lanes: Lanes,
    pub(crate) did_receive_update: bool,
    pub(crate) dependencies: Vec<ContextDependency>,
    /// Hooks the previous render had that this pass did not reach.
    pub(crate) missing: bool,
}

impl HookOutput {
    /// Drop render-phase updates queued on these hooks.
    pub(crate) fn discard_render_phase_updates(&self) {
        for hook in &self.hooks {
            if let Some(queue) = hook.queue() {
                queue.clear_pending();
            }
        }
    }
}

/// Hook cursor handed to a function component's render.
pub struct Hooks<'a> {
    env: &'a HookEnv<'a>,
    phase: HookPhase,
    current: Vec<Hook>,
    previous: Vec<Hook>,
    wip: Vec<Hook>,
    current_dirty: bool,
    effects: Vec<Rc<Effect>>,
    stores: Vec<StoreCheck>,
    flags: Flags,
    lanes: Lanes,
    skipped_lanes: Lanes,
    did_receive_update: bool,
    dependencies: Vec<ContextDependency>,
}

impl<'a> Hooks<'a> {
    pub(crate) fn new(env: &'a HookEnv<'a>, phase: HookPhase, current: Vec<Hook>, previous: Vec<Hook>) -> Self {
        Self {
            env,
            phase,
            current,
            previous,
            wip: Vec::new(),
            current_dirty: false,
            effects: Vec::new(),
            stores: Vec::new(),
            flags: Flags::empty(),
            lanes: Lanes::NONE,
            skipped_lanes: Lanes::NONE,
            did_receive_update: false,
            dependencies: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> HookOutput {
        let expected = match self.phase {
            HookPhase::Mount => 0,
            HookPhase::Update => self.current.len(),
            HookPhase::Rerender => self.previous.len(),
        };
        HookOutput {
            missing: self.wip.len() < expected,
            hooks: self.wip,
            current: self.current,
            current_dirty: self.current_dirty,
            effects: self.effects,
            stores: self.stores,
            flags: self.flags,
            lanes: self.lanes,
            skipped_lanes: self.skipped_lanes,
            did_receive_update: self.did_receive_update,
            dependencies: self.dependencies,
        }
    }

    fn violation(&self, error: ReconcilerError) -> ! {
        panic_any(InvariantViolation(error))
    }

    fn order_violation(&self, expected: HookKind, found: HookKind) -> ! {
        self.violation(ReconcilerError::HookOrder {
            component: self.env.component.to_string(),
            expected: expected.name(),
            found: found.name(),
        })
    }

    /// Claim the next slot on update or rerender, copying the prior hook.
    fn next_hook(&mut self, kind: HookKind) -> usize {
        let index = self.wip.len();
        let source = match self.phase {
            HookPhase::Rerender => &self.previous,
            _ => &self.current,
        };
        let Some(prev) = source.get(index) else {
            self.violation(ReconcilerError::TooManyHooks {
                component: self.env.component.to_string(),
            });
        };
        if prev.kind != kind {
            self.order_violation(prev.kind, kind);
        }
        let hook = prev.clone();
        self.wip.push(hook);
        index
    }

    fn mount(&mut self, kind: HookKind, state: HookState) -> usize {
        self.wip.push(Hook { kind, state });
        self.wip.len() - 1
    }

    fn downcast<T: 'static>(&self, value: AnyRc, kind: HookKind) -> Rc<T> {
        match value.downcast::<T>() {
            Ok(v) => v,
            Err(_) => self.order_violation(kind, kind),
        }
    }

    // -- state --------------------------------------------------------------

    /// Local state with an eager-bailout setter.
    pub fn use_state<T: PartialEq + 'static>(&mut self, init: impl FnOnce() -> T) -> (Rc<T>, StateSetter<T>) {
        let reducer: Reducer = Rc::new(basic_state_reducer::<T>);
        let (state, queue) = self.reducer_impl(HookKind::State, reducer, eq_any::<T>, || Rc::new(init()) as AnyRc);
        (
            self.downcast(state, HookKind::State),
            StateSetter {
                queue,
                _marker: PhantomData,
            },
        )
    }

    /// State driven by a reducer.
    pub fn use_reducer<S, A>(
        &mut self,
        reducer: impl Fn(&S, &A) -> S + 'static,
        init: impl FnOnce() -> S,
    ) -> (Rc<S>, Dispatch<A>)
    where
        S: PartialEq + 'static,
        A: 'static,
    {
        let erased: Reducer = Rc::new(move |state: &AnyRc, action: &AnyRc| -> AnyRc {
            match (state.downcast_ref::<S>(), action.downcast_ref::<A>()) {
                (Some(s), Some(a)) => Rc::new(reducer(s, a)),
                _ => state.clone(),
            }
        });
        let (state, queue) = self.reducer_impl(HookKind::Reducer, erased, eq_any::<S>, || Rc::new(init()) as AnyRc);
        (
            self.downcast(state, HookKind::Reducer),
            Dispatch {
                queue,
                _marker: PhantomData,
            },
        )
    }

    fn reducer_impl(
        &mut self,
        kind: HookKind,
        reducer: Reducer,
        eq: EqFn,
        init: impl FnOnce() -> AnyRc,
    ) -> (AnyRc, Rc<HookQueue>) {
        match self.phase {
            HookPhase::Mount => {
                let initial = init();
                let queue = Rc::new(HookQueue {
                    pending: RefCell::new(Vec::new()),
                    interleaved: RefCell::new(Vec::new()),
                    lanes: Cell::new(Lanes::NONE),
                    last_rendered_reducer: RefCell::new(reducer),
                    last_rendered_state: RefCell::new(initial.clone()),
                    state_eq: eq,
                    fiber: self.env.fiber,
                    mode: self.env.mode,
                    shared: Rc::downgrade(self.env.shared),
                });
                self.mount(
                    kind,
                    HookState::Reducer(ReducerHook {
                        memoized: initial.clone(),
                        base_state: initial.clone(),
                        base_queue: Vec::new(),
                        queue: queue.clone(),
                    }),
                );
                (initial, queue)
            }
            HookPhase::Update => self.update_reducer(kind, reducer),
            HookPhase::Rerender => self.rerender_reducer(kind, reducer),
        }
    }

    fn update_reducer(&mut self, kind: HookKind, reducer: Reducer) -> (AnyRc, Rc<HookQueue>) {
        let index = self.next_hook(kind);
        let HookState::Reducer(hook) = &self.wip[index].state else {
            self.order_violation(kind, kind);
        };
        let queue = hook.queue.clone();
        *queue.last_rendered_reducer.borrow_mut() = reducer.clone();

        // Pending updates join the base queue of the current hook too.
        let pending = std::mem::take(&mut *queue.pending.borrow_mut());
        let (base_state, base_queue) = match &mut self.current[index].state {
            HookState::Reducer(current) => {
                if !pending.is_empty() {
                    current.base_queue.extend(pending.iter().cloned());
                    self.current_dirty = true;
                }
                (current.base_state.clone(), current.base_queue.clone())
            }
            _ => self.order_violation(kind, kind),
        };

        let render_lanes = self.env.render_lanes;
        let mut state = base_state;
        let mut new_base_state: Option<AnyRc> = None;
        let mut new_base_queue: Vec<Rc<HookUpdate>> = Vec::new();
        for update in &base_queue {
            if !render_lanes.contains(update.lane) {
                if new_base_queue.is_empty() {
                    new_base_state = Some(state.clone());
                }
                new_base_queue.push(update.clone());
                self.lanes |= update.lane;
                self.skipped_lanes |= update.lane;
                continue;
            }
            if !new_base_queue.is_empty() {
                new_base_queue.push(update.rebased());
            }
            let eager = update.eager.borrow().clone();
            state = match eager {
                Some(eager) => eager,
                None => reducer(&state, &update.action),
            };
        }

        let HookState::Reducer(hook) = &mut self.wip[index].state else {
            self.order_violation(kind, kind);
        };
        if !(queue.state_eq)(state.as_ref(), hook.memoized.as_ref()) {
            self.did_receive_update = true;
        }
        hook.memoized = state.clone();
        hook.base_state = new_base_state.unwrap_or_else(|| state.clone());
        hook.base_queue = new_base_queue;
        *queue.last_rendered_state.borrow_mut() = state.clone();
        (state, queue)
    }

    fn rerender_reducer(&mut self, kind: HookKind, reducer: Reducer) -> (AnyRc, Rc<HookQueue>) {
        let index = self.next_hook(kind);
        let HookState::Reducer(hook) = &mut self.wip[index].state else {
            self.order_violation(kind, kind);
        };
        let queue = hook.queue.clone();
        *queue.last_rendered_reducer.borrow_mut() = reducer.clone();
        let pending = std::mem::take(&mut *queue.pending.borrow_mut());
        let mut state = hook.memoized.clone();
        for update in &pending {
            state = reducer(&state, &update.action);
        }
        let changed = !(queue.state_eq)(state.as_ref(), hook.memoized.as_ref());
        hook.memoized = state.clone();
        if hook.base_queue.is_empty() {
            hook.base_state = state.clone();
        }
        if changed {
            self.did_receive_update = true;
        }
        *queue.last_rendered_state.borrow_mut() = state.clone();
        (state, queue)
    }

    // -- effects ------------------------------------------------------------

    /// Passive effect run after every commit of this component.
    pub fn use_effect<C: IntoCleanup>(&mut self, create: impl FnOnce() -> C + 'static) {
        self.effect_impl(HookKind::Effect, Box::new(move || create().into_cleanup()), None);
    }

    /// Passive effect re-run when `deps` change.
    ///
    /// `deps` is compared as one value with `PartialEq`, so several inputs
    /// go in a tuple.
    pub fn use_effect_with<D, C>(&mut self, deps: D, create: impl FnOnce() -> C + 'static)
    where
        D: PartialEq + 'static,
        C: IntoCleanup,
    {
        self.effect_impl(
            HookKind::Effect,
            Box::new(move || create().into_cleanup()),
            Some(Deps::of(deps)),
        );
    }

    /// Effect run synchronously after mutations, before paint.
    pub fn use_layout_effect<C: IntoCleanup>(&mut self, create: impl FnOnce() -> C + 'static) {
        self.effect_impl(HookKind::LayoutEffect, Box::new(move || create().into_cleanup()), None);
    }

    pub fn use_layout_effect_with<D, C>(&mut self, deps: D, create: impl FnOnce() -> C + 'static)
    where
        D: PartialEq + 'static,
        C: IntoCleanup,
    {
        self.effect_impl(
            HookKind::LayoutEffect,
            Box::new(move || create().into_cleanup()),
            Some(Deps::of(deps)),
        );
    }

    /// Effect run during the mutation phase, before layout effects.
    pub fn use_insertion_effect_with<D, C>(&mut self, deps: D, create: impl FnOnce() -> C + 'static)
    where
        D: PartialEq + 'static,
        C: IntoCleanup,
    {
        self.effect_impl(
            HookKind::InsertionEffect,
            Box::new(move || create().into_cleanup()),
            Some(Deps::of(deps)),
        );
    }

    fn effect_impl(&mut self, kind: HookKind, create: EffectCreate, deps: Option<Deps>) {
        let (hook_flags, mount_flags, update_flags) = match kind {
            HookKind::LayoutEffect => (
                HookFlags::LAYOUT,
                Flags::UPDATE | Flags::LAYOUT_STATIC,
                Flags::UPDATE,
            ),
            HookKind::InsertionEffect => (HookFlags::INSERTION, Flags::UPDATE, Flags::UPDATE),
            _ => (
                HookFlags::PASSIVE,
                Flags::PASSIVE | Flags::PASSIVE_STATIC,
                Flags::PASSIVE,
            ),
        };
        if self.phase == HookPhase::Mount {
            let effect = self.push_effect(HookFlags::HAS_EFFECT | hook_flags, create, Rc::default(), deps);
            self.flags |= mount_flags;
            self.mount(kind, HookState::Effect(effect));
            return;
        }

        let index = self.next_hook(kind);
        let committed = match self.current.get(index).map(|h| &h.state) {
            Some(HookState::Effect(prev)) => Some(prev.clone()),
            _ => None,
        };
        let inst = match (&committed, &self.wip[index].state) {
            (Some(prev), _) => prev.inst.clone(),
            (None, HookState::Effect(prev)) => prev.inst.clone(),
            _ => Rc::default(),
        };
        let unchanged = committed
            .as_ref()
            .is_some_and(|prev| deps_equal(deps.as_ref(), prev.deps.as_ref()));
        let tag = if unchanged {
            hook_flags
        } else {
            self.flags |= update_flags;
            HookFlags::HAS_EFFECT | hook_flags
        };
        if committed.is_none() {
            // Mounted by an earlier pass of this render.
            self.flags |= mount_flags & Flags::STATIC_MASK;
        }
        let effect = self.push_effect(tag, create, inst, deps);
        self.wip[index].state = HookState::Effect(effect);
    }

    fn push_effect(&mut self, tag: HookFlags, create: EffectCreate, inst: Rc<EffectInstance>, deps: Option<Deps>) -> Rc<Effect> {
        let effect = Rc::new(Effect {
            tag,
            create: RefCell::new(Some(create)),
            inst,
            deps,
        });
        self.effects.push(effect.clone());
        effect
    }

    // -- memo and refs ------------------------------------------------------

    /// Value recomputed only when `deps` change.
    pub fn use_memo<T: 'static, D: PartialEq + 'static>(&mut self, create: impl FnOnce() -> T, deps: D) -> Rc<T> {
        let deps = Deps::of(deps);
        if self.phase == HookPhase::Mount {
            let value: AnyRc = Rc::new(create());
            self.mount(
                HookKind::Memo,
                HookState::Memo {
                    value: value.clone(),
                    deps: Some(deps),
                },
            );
            return self.downcast(value, HookKind::Memo);
        }
        let index = self.next_hook(HookKind::Memo);
        if let HookState::Memo {
            value,
            deps: Some(prev),
        } = &self.wip[index].state
            && deps.same(prev)
        {
            let value = value.clone();
            return self.downcast(value, HookKind::Memo);
        }
        let value: AnyRc = Rc::new(create());
        self.wip[index].state = HookState::Memo {
            value: value.clone(),
            deps: Some(deps),
        };
        self.downcast(value, HookKind::Memo)
    }

    /// Callback whose identity is stable while `deps` are unchanged.
    pub fn use_callback<F: 'static, D: PartialEq + 'static>(&mut self, callback: F, deps: D) -> Rc<F> {
        self.use_memo(move || callback, deps)
    }

    /// Mutable cell that lives as long as the component.
    pub fn use_ref<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<RefCell<T>> {
        if self.phase == HookPhase::Mount {
            let cell: AnyRc = Rc::new(RefCell::new(init()));
            self.mount(HookKind::Ref, HookState::Ref(cell.clone()));
            return self.downcast(cell, HookKind::Ref);
        }
        let index = self.next_hook(HookKind::Ref);
        let HookState::Ref(cell) = &self.wip[index].state else {
            self.order_violation(HookKind::Ref, HookKind::Ref);
        };
        let cell = cell.clone();
        self.downcast(cell, HookKind::Ref)
    }

    // -- context ------------------------------------------------------------

    /// Nearest provided value of `context`; re-renders when it changes.
    pub fn use_context<T: PartialEq + 'static>(&mut self, context: &Context<T>) -> Rc<T> {
        let value = self.env.contexts.read(context.def());
        self.dependencies.push(ContextDependency {
            def: context.def().clone(),
            value: value.clone(),
        });
        match value.downcast::<T>() {
            Ok(v) => v,
            Err(_) => self.violation(ReconcilerError::UnsupportedKind(format!(
                "context `{}` holds a value of another type",
                context.def().name()
            ))),
        }
    }

    // -- concurrent features ------------------------------------------------

    /// Pending flag plus a starter that runs updates as a transition.
    pub fn use_transition(&mut self) -> (bool, TransitionStarter) {
        let (pending, set_pending) = self.use_state(|| false);
        if self.phase == HookPhase::Mount {
            let starter = TransitionStarter {
                set_pending,
                shared: Rc::downgrade(self.env.shared),
            };
            self.mount(HookKind::Transition, HookState::Transition(starter.clone()));
            return (*pending, starter);
        }
        let index = self.next_hook(HookKind::Transition);
        let HookState::Transition(starter) = &self.wip[index].state else {
            self.order_violation(HookKind::Transition, HookKind::Transition);
        };
        (*pending, starter.clone())
    }

    /// `value`, lagging behind during urgent renders.
    ///
    /// An urgent render keeps the previous value and schedules a transition
    /// render that catches up.
    pub fn use_deferred_value<T: PartialEq + 'static>(&mut self, value: T) -> Rc<T> {
        if self.phase == HookPhase::Mount {
            let value: AnyRc = Rc::new(value);
            self.mount(
                HookKind::DeferredValue,
                HookState::Deferred {
                    value: value.clone(),
                    inconsistent: false,
                },
            );
            return self.downcast(value, HookKind::DeferredValue);
        }
        let index = self.next_hook(HookKind::DeferredValue);
        let HookState::Deferred {
            value: prev,
            inconsistent,
        } = &self.wip[index].state
        else {
            self.order_violation(HookKind::DeferredValue, HookKind::DeferredValue);
        };
        let (prev, was_inconsistent) = (prev.clone(), *inconsistent);
        let prev_typed: Rc<T> = self.downcast(prev.clone(), HookKind::DeferredValue);

        if !self.env.render_lanes.includes_only_non_urgent() {
            if *prev_typed != value {
                let lane = self.env.shared.lanes.claim_next_transition_lane();
                self.lanes |= lane;
                self.skipped_lanes |= lane;
                self.wip[index].state = HookState::Deferred {
                    value: prev,
                    inconsistent: true,
                };
                tracing::trace!(target: "fibra.hooks", lane = %lane, "deferred value scheduled");
            }
            return prev_typed;
        }

        if was_inconsistent {
            self.did_receive_update = true;
        }
        let next: AnyRc = Rc::new(value);
        self.wip[index].state = HookState::Deferred {
            value: next.clone(),
            inconsistent: false,
        };
        self.downcast(next, HookKind::DeferredValue)
    }

    /// Read an external store without tearing.
    ///
    /// The snapshot is re-read before commit when the render was time
    /// sliced; a changed store forces a synchronous re-render.
    pub fn use_sync_external_store<T: PartialEq + 'static>(
        &mut self,
        subscribe: &Subscribe,
        get_snapshot: &Rc<dyn Fn() -> T>,
    ) -> Rc<T> {
        let typed = get_snapshot.clone();
        let erased: SnapshotFn = Rc::new(move || Rc::new(typed()) as AnyRc);
        let snapshot_id = Rc::as_ptr(get_snapshot).cast::<()>() as usize;
        let subscribe_id = Rc::as_ptr(subscribe).cast::<()>() as usize;
        let next = erased();
        let eq: EqFn = eq_any::<T>;

        if self.phase == HookPhase::Mount {
            if !self.env.blocking {
                self.push_store_check(erased.clone(), next.clone(), eq);
            }
            let inst = Rc::new(StoreInstance {
                value: RefCell::new(next.clone()),
                get_snapshot: RefCell::new(erased.clone()),
                snapshot_id: Cell::new(snapshot_id),
                eq,
            });
            self.mount(
                HookKind::SyncExternalStore,
                HookState::Store {
                    value: next.clone(),
                    inst: inst.clone(),
                },
            );
            self.subscribe_effect(subscribe, subscribe_id, inst.clone());
            self.flags |= Flags::PASSIVE;
            self.push_store_update(inst, next.clone(), erased, snapshot_id);
            return self.downcast(next, HookKind::SyncExternalStore);
        }

        let index = self.next_hook(HookKind::SyncExternalStore);
        let HookState::Store { value: prev, inst } = &self.wip[index].state else {
            self.order_violation(HookKind::SyncExternalStore, HookKind::SyncExternalStore);
        };
        let inst = inst.clone();
        let changed = !eq(prev.as_ref(), next.as_ref());
        if changed {
            self.wip[index].state = HookState::Store {
                value: next.clone(),
                inst: inst.clone(),
            };
            self.did_receive_update = true;
        }
        let resubscribed = self.subscribe_effect(subscribe, subscribe_id, inst.clone());
        if inst.snapshot_id.get() != snapshot_id || changed || resubscribed {
            self.flags |= Flags::PASSIVE;
            self.push_store_update(inst, next.clone(), erased.clone(), snapshot_id);
            if !self.env.blocking {
                self.push_store_check(erased, next.clone(), eq);
            }
        }
        self.downcast(next, HookKind::SyncExternalStore)
    }

    fn push_store_check(&mut self, get_snapshot: SnapshotFn, value: AnyRc, eq: EqFn) {
        self.flags |= Flags::STORE_CONSISTENCY;
        self.stores.push(StoreCheck {
            get_snapshot,
            value,
            eq,
        });
    }

    /// Effect hook that subscribes to the store. Returns true if it re-subscribes.
    fn subscribe_effect(&mut self, subscribe: &Subscribe, subscribe_id: usize, inst: Rc<StoreInstance>) -> bool {
        let subscribe = subscribe.clone();
        let shared = Rc::downgrade(self.env.shared);
        let fiber = self.env.fiber;
        self.effect_impl(
            HookKind::Effect,
            Box::new(move || {
                let listener: StoreListener = Rc::new(move || {
                    if inst.changed()
                        && let Some(shared) = shared.upgrade()
                    {
                        shared.post(InboxEntry::ForceSync { fiber });
                    }
                });
                subscribe(listener)
            }),
            Some(Deps::of(subscribe_id)),
        );
        self.effects
            .last()
            .is_some_and(|e| e.tag.contains(HookFlags::HAS_EFFECT))
    }

    fn push_store_update(&mut self, inst: Rc<StoreInstance>, value: AnyRc, get_snapshot: SnapshotFn, snapshot_id: usize) {
        let shared = Rc::downgrade(self.env.shared);
        let fiber = self.env.fiber;
        self.push_effect(
            HookFlags::HAS_EFFECT | HookFlags::PASSIVE,
            Box::new(move || {
                *inst.value.borrow_mut() = value;
                *inst.get_snapshot.borrow_mut() = get_snapshot;
                inst.snapshot_id.set(snapshot_id);
                if inst.changed()
                    && let Some(shared) = shared.upgrade()
                {
                    shared.post(InboxEntry::ForceSync { fiber });
                }
                Cleanup::none()
            }),
            Rc::default(),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibra_core::{CallbackHandle, Scheduler, SchedulerPriority, Task, Timestamp};

    struct IdleScheduler;

    impl Scheduler for IdleScheduler {
        fn schedule_callback(&self, _: SchedulerPriority, _: Task, _: Option<Timestamp>) -> CallbackHandle {
            CallbackHandle::from_raw(1)
        }
        fn cancel_callback(&self, _: CallbackHandle) {}
        fn should_yield(&self) -> bool {
            false
        }
        fn now(&self) -> Timestamp {
            0
        }
    }

    fn with_env(f: impl FnOnce(&HookEnv<'_>)) {
        let shared = Rc::new(Shared::new(Rc::new(IdleScheduler)));
        let contexts = ContextStack::default();
        let env = HookEnv {
            component: "Effects",
            shared: &shared,
            contexts: &contexts,
            fiber: FiberId::default(),
            mode: Mode::CONCURRENT,
            render_lanes: Lanes::DEFAULT,
            blocking: true,
        };
        f(&env);
    }

    fn two_effects(hooks: &mut Hooks<'_>) {
        hooks.use_effect(|| ());
        hooks.use_layout_effect_with((), || ());
    }

    #[test]
    fn mount_sets_static_effect_flags() {
        with_env(|env| {
            let mut hooks = Hooks::new(env, HookPhase::Mount, Vec::new(), Vec::new());
            two_effects(&mut hooks);
            let out = hooks.finish();
            assert!(out.flags.contains(Flags::PASSIVE_STATIC | Flags::LAYOUT_STATIC));
            assert_eq!(out.effects.len(), 2);
        });
    }

    #[test]
    fn rerendering_a_mount_keeps_static_effect_flags() {
        with_env(|env| {
            let mut first = Hooks::new(env, HookPhase::Mount, Vec::new(), Vec::new());
            two_effects(&mut first);
            let first = first.finish();

            let mut again = Hooks::new(env, HookPhase::Rerender, first.current, first.hooks);
            two_effects(&mut again);
            let again = again.finish();
            assert!(!again.missing);
            assert!(again.flags.contains(
                Flags::PASSIVE | Flags::PASSIVE_STATIC | Flags::UPDATE | Flags::LAYOUT_STATIC
            ));
            assert!(again.effects.iter().all(|e| e.tag.contains(HookFlags::HAS_EFFECT)));
        });
    }
}
