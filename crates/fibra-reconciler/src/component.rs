#![forbid(unsafe_code)]

//! Component definitions.
//!
//! Function components render through a [`Hooks`] cursor. Class components
//! implement [`ClassComponent`] and keep their state in a shallow-merged
//! [`ClassState`]. Memo and lazy wrappers decorate another element type.

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fibra_core::props::{shallow_equal, PropMap, PropValue};
use fibra_core::{ComponentError, Throw, Timestamp, Wakeable};

use crate::class_component::Updater;
use crate::element::{Element, ElementType, Props};
use crate::hooks::Hooks;

/// Result of a render call.
pub type RenderResult = Result<Element, Throw>;

type RenderFn = Box<dyn Fn(&Props, &mut Hooks<'_>) -> RenderResult>;

/// A function component.
pub struct FunctionComponent {
    name: Cow<'static, str>,
    render: RenderFn,
}

impl FunctionComponent {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        render: impl Fn(&Props, &mut Hooks<'_>) -> RenderResult + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            render: Box::new(render),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, props: &Props, hooks: &mut Hooks<'_>) -> RenderResult {
        (self.render)(props, hooks)
    }
}

impl fmt::Debug for FunctionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionComponent({})", self.name)
    }
}

// ---------------------------------------------------------------------------
// Class components
// ---------------------------------------------------------------------------

/// Shallow-merged class component state.
#[derive(Clone, Default)]
pub struct ClassState(Rc<PropMap>);

impl ClassState {
    #[must_use]
    pub fn new(map: PropMap) -> Self {
        Self(Rc::new(map))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn as_map(&self) -> &PropMap {
        &self.0
    }

    /// New state with `partial` merged over `self`.
    #[must_use]
    pub fn merged(&self, partial: &PropMap) -> Self {
        let mut next = (*self.0).clone();
        next.extend(partial.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(Rc::new(next))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ClassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Information about a captured error.
#[derive(Debug, Clone, Default)]
pub struct ErrorInfo {
    /// One line per ancestor, innermost first.
    pub component_stack: String,
}

/// Lifecycle of a class component. Only `render` is required.
pub trait ClassComponent {
    fn render(&self, props: &Props, state: &ClassState) -> RenderResult;

    fn component_did_mount(&mut self, _props: &Props, _state: &ClassState) -> Result<(), ComponentError> {
        Ok(())
    }

    fn component_did_update(
        &mut self,
        _props: &Props,
        _state: &ClassState,
        _prev_props: &Props,
        _prev_state: &ClassState,
        _snapshot: Option<Rc<dyn Any>>,
    ) -> Result<(), ComponentError> {
        Ok(())
    }

    fn component_will_unmount(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }

    fn get_snapshot_before_update(
        &mut self,
        _prev_props: &Props,
        _prev_state: &ClassState,
    ) -> Result<Option<Rc<dyn Any>>, ComponentError> {
        Ok(None)
    }

    fn should_component_update(&self, _next_props: &Props, _next_state: &ClassState) -> bool {
        true
    }

    /// Opt into pure-component semantics: skip updates whose props and state
    /// are shallowly equal.
    fn is_pure(&self) -> bool {
        false
    }

    /// Partial state derived from props before every render.
    fn get_derived_state_from_props(&self, _props: &Props, _state: &ClassState) -> Option<PropMap> {
        None
    }

    /// True if this component catches errors thrown below it.
    fn is_error_boundary(&self) -> bool {
        false
    }

    /// Partial state to render after a descendant threw.
    fn get_derived_state_from_error(&self, _error: &ComponentError) -> Option<PropMap> {
        None
    }

    fn component_did_catch(&mut self, _error: &ComponentError, _info: &ErrorInfo) {}
}

type Constructor = Box<dyn Fn(&Props, Updater) -> Box<dyn ClassComponent>>;
type InitialState = Box<dyn Fn(&Props) -> PropMap>;

/// Definition of a class component type.
pub struct ClassDef {
    name: Cow<'static, str>,
    construct: Constructor,
    initial_state: Option<InitialState>,
}

impl ClassDef {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        construct: impl Fn(&Props, Updater) -> Box<dyn ClassComponent> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            construct: Box::new(construct),
            initial_state: None,
        })
    }

    /// Like [`ClassDef::new`] with an initial state derived from props.
    pub fn with_initial_state(
        name: impl Into<Cow<'static, str>>,
        initial_state: impl Fn(&Props) -> PropMap + 'static,
        construct: impl Fn(&Props, Updater) -> Box<dyn ClassComponent> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            construct: Box::new(construct),
            initial_state: Some(Box::new(initial_state)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn construct(&self, props: &Props, updater: Updater) -> Box<dyn ClassComponent> {
        (self.construct)(props, updater)
    }

    pub(crate) fn initial_state(&self, props: &Props) -> ClassState {
        self.initial_state
            .as_ref()
            .map(|f| ClassState::new(f(props)))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Memo
// ---------------------------------------------------------------------------

type CompareFn = Box<dyn Fn(&Props, &Props) -> bool>;

/// Wrapper that skips re-rendering when props compare equal.
pub struct MemoComponent {
    inner: ElementType,
    compare: Option<CompareFn>,
}

impl MemoComponent {
    /// Memoize with shallow attribute comparison.
    pub fn new(inner: ElementType) -> Rc<Self> {
        Rc::new(Self {
            inner,
            compare: None,
        })
    }

    pub fn with_compare(
        inner: ElementType,
        compare: impl Fn(&Props, &Props) -> bool + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            inner,
            compare: Some(Box::new(compare)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &ElementType {
        &self.inner
    }

    pub(crate) fn has_custom_compare(&self) -> bool {
        self.compare.is_some()
    }

    pub(crate) fn props_equal(&self, prev: &Props, next: &Props) -> bool {
        match &self.compare {
            Some(compare) => compare(prev, next),
            None => shallow_equal(prev.attrs(), next.attrs()) && prev.same_children(next),
        }
    }
}

// ---------------------------------------------------------------------------
// Lazy
// ---------------------------------------------------------------------------

pub(crate) enum LazyState {
    Uninitialized,
    Pending(Wakeable),
    Resolved(ElementType),
    Rejected(ComponentError),
}

type Loader = Box<dyn FnOnce(LazyResolver)>;

/// Element type loaded on first render.
pub struct LazyComponent {
    name: Cow<'static, str>,
    state: Rc<RefCell<LazyState>>,
    loader: RefCell<Option<Loader>>,
}

impl LazyComponent {
    /// `loader` runs once, on first render, and settles the resolver now or later.
    pub fn new(name: impl Into<Cow<'static, str>>, loader: impl FnOnce(LazyResolver) + 'static) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            state: Rc::new(RefCell::new(LazyState::Uninitialized)),
            loader: RefCell::new(Some(Box::new(loader))),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved type, or the reason rendering cannot continue.
    pub(crate) fn resolve(&self) -> Result<ElementType, Throw> {
        let uninitialized = matches!(*self.state.borrow(), LazyState::Uninitialized);
        if uninitialized {
            let wakeable = Wakeable::new();
            *self.state.borrow_mut() = LazyState::Pending(wakeable);
            let loader = self.loader.borrow_mut().take();
            if let Some(loader) = loader {
                loader(LazyResolver {
                    state: self.state.clone(),
                });
            }
        }
        match &*self.state.borrow() {
            LazyState::Resolved(ty) => Ok(ty.clone()),
            LazyState::Pending(w) => Err(Throw::Suspend(w.clone())),
            LazyState::Rejected(e) => Err(Throw::Error(e.clone())),
            LazyState::Uninitialized => Err(Throw::error("lazy component has no loader")),
        }
    }
}

/// Settles a [`LazyComponent`].
pub struct LazyResolver {
    state: Rc<RefCell<LazyState>>,
}

impl LazyResolver {
    pub fn resolve(self, ty: ElementType) {
        let previous = std::mem::replace(&mut *self.state.borrow_mut(), LazyState::Resolved(ty));
        if let LazyState::Pending(w) = previous {
            w.resolve();
        }
    }

    pub fn reject(self, error: ComponentError) {
        let previous = std::mem::replace(&mut *self.state.borrow_mut(), LazyState::Rejected(error));
        if let LazyState::Pending(w) = previous {
            w.resolve();
        }
    }
}

// ---------------------------------------------------------------------------
// Profiler
// ---------------------------------------------------------------------------

/// Whether a profiled subtree mounted or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerPhase {
    Mount,
    Update,
}

/// One render of a profiled subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerReport {
    pub id: String,
    pub phase: ProfilerPhase,
    pub actual_duration: Timestamp,
    pub commit_time: Timestamp,
}

/// A profiling boundary.
pub struct ProfilerDef {
    id: String,
    on_render: Box<dyn Fn(&ProfilerReport)>,
}

impl ProfilerDef {
    pub fn new(id: impl Into<String>, on_render: impl Fn(&ProfilerReport) + 'static) -> Rc<Self> {
        Rc::new(Self {
            id: id.into(),
            on_render: Box::new(on_render),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn report(&self, report: &ProfilerReport) {
        (self.on_render)(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_state_merges_shallowly() {
        let mut base = PropMap::new();
        base.insert("a".into(), 1.into());
        base.insert("b".into(), 2.into());
        let state = ClassState::new(base);
        let mut partial = PropMap::new();
        partial.insert("b".into(), 3.into());
        let next = state.merged(&partial);
        assert_eq!(next.get("a"), Some(&PropValue::from(1)));
        assert_eq!(next.get("b"), Some(&PropValue::from(3)));
        assert_eq!(state.get("b"), Some(&PropValue::from(2)));
    }

    #[test]
    fn lazy_resolved_synchronously_never_suspends() {
        let lazy = LazyComponent::new("Sync", |r| r.resolve(ElementType::Host("div".into())));
        assert!(matches!(lazy.resolve(), Ok(ElementType::Host(t)) if &*t == "div"));
    }

    #[test]
    fn lazy_pending_suspends_until_resolved() {
        let slot: Rc<RefCell<Option<LazyResolver>>> = Rc::default();
        let captured = slot.clone();
        let lazy = LazyComponent::new("Later", move |r| *captured.borrow_mut() = Some(r));
        let Err(Throw::Suspend(w)) = lazy.resolve() else {
            panic!("expected suspension");
        };
        assert!(w.is_pending());
        slot.borrow_mut().take().expect("loader ran").resolve(ElementType::Text);
        assert!(!w.is_pending());
        assert!(matches!(lazy.resolve(), Ok(ElementType::Text)));
    }

    #[test]
    fn lazy_rejection_surfaces_as_error() {
        let lazy = LazyComponent::new("Bad", |r| r.reject(ComponentError::new("no module")));
        assert!(matches!(lazy.resolve(), Err(Throw::Error(e)) if e.message() == "no module"));
    }

    #[test]
    fn memo_default_compare_is_shallow() {
        let memo = MemoComponent::new(ElementType::Host("div".into()));
        let a = Element::host("x").attr("n", 1);
        let b = Element::host("x").attr("n", 1);
        let c = Element::host("x").attr("n", 2);
        assert!(memo.props_equal(a.props(), b.props()));
        assert!(!memo.props_equal(a.props(), c.props()));
    }
}
