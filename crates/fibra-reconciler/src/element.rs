#![forbid(unsafe_code)]

//! Immutable element descriptions.
//!
//! An [`Element`] says *what* should be on screen: a type, an optional key
//! and ref, and [`Props`]. Elements are cheap to clone; props are shared
//! behind an `Rc` and compared by identity, which is what lets an unchanged
//! subtree bail out without re-rendering.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fibra_core::props::{PropMap, PropValue};
use fibra_core::PortalId;

use crate::component::{ClassDef, FunctionComponent, LazyComponent, MemoComponent, ProfilerDef};
use crate::context::ContextDef;

/// Reconciliation key.
pub type Key = Rc<str>;

pub(crate) type ConsumerFn = Rc<dyn Fn(&dyn Any) -> Element>;

/// Visibility mode of an offscreen subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffscreenMode {
    Visible,
    Hidden,
}

/// Order in which a suspense list reveals its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealOrder {
    Forwards,
    Backwards,
    Together,
}

/// How a suspense list renders rows after the first pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    Collapsed,
    Hidden,
}

/// Coordination settings of a suspense list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspenseListConfig {
    pub reveal_order: Option<RevealOrder>,
    pub tail: Option<TailMode>,
}

/// What an element renders as.
#[derive(Clone)]
pub enum ElementType {
    Host(Rc<str>),
    Text,
    Function(Rc<FunctionComponent>),
    Class(Rc<ClassDef>),
    Memo(Rc<MemoComponent>),
    Lazy(Rc<LazyComponent>),
    Fragment,
    Provider(Rc<ContextDef>),
    Consumer(Rc<ContextDef>),
    Suspense,
    SuspenseList(SuspenseListConfig),
    Portal(PortalId),
    Offscreen,
    Profiler(Rc<ProfilerDef>),
}

impl ElementType {
    /// Identity comparison used to decide whether a fiber can be reused.
    #[must_use]
    pub fn same_type(&self, other: &ElementType) -> bool {
        match (self, other) {
            (Self::Host(a), Self::Host(b)) => a == b,
            (Self::Text, Self::Text)
            | (Self::Fragment, Self::Fragment)
            | (Self::Suspense, Self::Suspense)
            | (Self::SuspenseList(_), Self::SuspenseList(_))
            | (Self::Offscreen, Self::Offscreen) => true,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Memo(a), Self::Memo(b)) => Rc::ptr_eq(a, b),
            (Self::Lazy(a), Self::Lazy(b)) => Rc::ptr_eq(a, b),
            (Self::Provider(a), Self::Provider(b)) => Rc::ptr_eq(a, b),
            (Self::Consumer(a), Self::Consumer(b)) => Rc::ptr_eq(a, b),
            (Self::Portal(a), Self::Portal(b)) => a == b,
            (Self::Profiler(a), Self::Profiler(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Display name used in logs and component stacks.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Host(t) => t.to_string(),
            Self::Text => "#text".into(),
            Self::Function(f) => f.name().to_string(),
            Self::Class(c) => c.name().to_string(),
            Self::Memo(m) => format!("Memo({})", m.inner().name()),
            Self::Lazy(l) => format!("Lazy({})", l.name()),
            Self::Fragment => "Fragment".into(),
            Self::Provider(c) => format!("{}.Provider", c.name()),
            Self::Consumer(c) => format!("{}.Consumer", c.name()),
            Self::Suspense => "Suspense".into(),
            Self::SuspenseList(_) => "SuspenseList".into(),
            Self::Portal(_) => "Portal".into(),
            Self::Offscreen => "Offscreen".into(),
            Self::Profiler(p) => format!("Profiler({})", p.id()),
        }
    }
}

impl fmt::Debug for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Clone, Default)]
pub(crate) enum PropsExtra {
    #[default]
    None,
    Text(Rc<str>),
    Fallback(Element),
    Value(Rc<dyn Any>),
    Consumer(ConsumerFn),
    Offscreen(OffscreenMode),
}

#[derive(Clone, Default)]
pub(crate) struct PropsInner {
    pub(crate) attrs: PropMap,
    pub(crate) children: Vec<Element>,
    pub(crate) extra: PropsExtra,
}

/// Shared, identity-compared props of an element.
#[derive(Clone, Default)]
pub struct Props(Rc<PropsInner>);

impl Props {
    #[must_use]
    pub fn new(attrs: PropMap) -> Self {
        Self(Rc::new(PropsInner {
            attrs,
            ..PropsInner::default()
        }))
    }

    pub(crate) fn from_parts(attrs: PropMap, children: Vec<Element>, extra: PropsExtra) -> Self {
        Self(Rc::new(PropsInner {
            attrs,
            children,
            extra,
        }))
    }

    pub(crate) fn with_children(children: Vec<Element>) -> Self {
        Self::from_parts(PropMap::new(), children, PropsExtra::None)
    }

    #[must_use]
    pub fn attrs(&self) -> &PropMap {
        &self.0.attrs
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.0.attrs.get(key)
    }

    #[must_use]
    pub fn children(&self) -> &[Element] {
        &self.0.children
    }

    /// Text content of a text element.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.0.extra {
            PropsExtra::Text(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn extra(&self) -> &PropsExtra {
        &self.0.extra
    }

    pub(crate) fn fallback(&self) -> Option<&Element> {
        match &self.0.extra {
            PropsExtra::Fallback(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn context_value(&self) -> Option<&Rc<dyn Any>> {
        match &self.0.extra {
            PropsExtra::Value(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn offscreen_mode(&self) -> OffscreenMode {
        match &self.0.extra {
            PropsExtra::Offscreen(mode) => *mode,
            _ => OffscreenMode::Visible,
        }
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Props) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// True if both child lists hold the same elements by identity.
    #[must_use]
    pub fn same_children(&self, other: &Props) -> bool {
        let (a, b) = (self.children(), other.children());
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ptr_eq(y))
    }

    fn make_mut(&mut self) -> &mut PropsInner {
        Rc::make_mut(&mut self.0)
    }
}

impl fmt::Debug for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Props")
            .field("attrs", &self.0.attrs)
            .field("children", &self.0.children.len())
            .finish()
    }
}

/// Mutable cell a committed host instance is attached to.
#[derive(Clone, Default)]
pub struct RefObject(Rc<RefCell<Option<Rc<dyn Any>>>>);

impl RefObject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, if attached and of type `T`.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        let value = self.0.borrow().clone()?;
        value.downcast::<T>().ok()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub(crate) fn set(&self, value: Option<Rc<dyn Any>>) {
        *self.0.borrow_mut() = value;
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &RefObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

pub(crate) fn same_ref(a: Option<&RefObject>, b: Option<&RefObject>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.ptr_eq(b),
        _ => false,
    }
}

/// A description of UI.
#[derive(Clone)]
pub struct Element {
    pub(crate) ty: ElementType,
    pub(crate) key: Option<Key>,
    pub(crate) ref_: Option<RefObject>,
    pub(crate) props: Props,
}

impl Element {
    fn of(ty: ElementType, props: Props) -> Self {
        Self {
            ty,
            key: None,
            ref_: None,
            props,
        }
    }

    /// A host element such as `div`.
    pub fn host(ty: &str) -> Self {
        Self::of(ElementType::Host(Rc::from(ty)), Props::default())
    }

    /// A text node.
    pub fn text(text: impl AsRef<str>) -> Self {
        Self::of(
            ElementType::Text,
            Props::from_parts(PropMap::new(), Vec::new(), PropsExtra::Text(Rc::from(text.as_ref()))),
        )
    }

    /// Renders nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::fragment(Vec::new())
    }

    pub fn fragment(children: Vec<Element>) -> Self {
        Self::of(ElementType::Fragment, Props::with_children(children))
    }

    pub fn component(component: &Rc<FunctionComponent>) -> Self {
        Self::of(ElementType::Function(component.clone()), Props::default())
    }

    pub fn class(def: &Rc<ClassDef>) -> Self {
        Self::of(ElementType::Class(def.clone()), Props::default())
    }

    pub fn memo(memo: &Rc<MemoComponent>) -> Self {
        Self::of(ElementType::Memo(memo.clone()), Props::default())
    }

    pub fn lazy(lazy: &Rc<LazyComponent>) -> Self {
        Self::of(ElementType::Lazy(lazy.clone()), Props::default())
    }

    /// A suspense boundary showing `fallback` while `children` are pending.
    pub fn suspense(fallback: Element, children: Vec<Element>) -> Self {
        Self::of(
            ElementType::Suspense,
            Props::from_parts(PropMap::new(), children, PropsExtra::Fallback(fallback)),
        )
    }

    pub fn suspense_list(config: SuspenseListConfig, children: Vec<Element>) -> Self {
        Self::of(ElementType::SuspenseList(config), Props::with_children(children))
    }

    /// Children rendered into a registered portal container.
    pub fn portal(target: PortalId, children: Vec<Element>) -> Self {
        Self::of(ElementType::Portal(target), Props::with_children(children))
    }

    pub fn offscreen(mode: OffscreenMode, children: Vec<Element>) -> Self {
        Self::of(
            ElementType::Offscreen,
            Props::from_parts(PropMap::new(), children, PropsExtra::Offscreen(mode)),
        )
    }

    pub fn profiler(def: &Rc<ProfilerDef>, children: Vec<Element>) -> Self {
        Self::of(ElementType::Profiler(def.clone()), Props::with_children(children))
    }

    pub(crate) fn provider(def: Rc<ContextDef>, value: Rc<dyn Any>, children: Vec<Element>) -> Self {
        Self::of(
            ElementType::Provider(def),
            Props::from_parts(PropMap::new(), children, PropsExtra::Value(value)),
        )
    }

    pub(crate) fn consumer(def: Rc<ContextDef>, render: ConsumerFn) -> Self {
        Self::of(
            ElementType::Consumer(def),
            Props::from_parts(PropMap::new(), Vec::new(), PropsExtra::Consumer(render)),
        )
    }

    // -- builders -----------------------------------------------------------

    #[must_use]
    pub fn key(mut self, key: impl AsRef<str>) -> Self {
        self.key = Some(Rc::from(key.as_ref()));
        self
    }

    #[must_use]
    pub fn with_ref(mut self, r: &RefObject) -> Self {
        self.ref_ = Some(r.clone());
        self
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.make_mut().attrs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn attrs(mut self, attrs: PropMap) -> Self {
        self.props.make_mut().attrs.extend(attrs);
        self
    }

    #[must_use]
    pub fn child(mut self, child: Element) -> Self {
        self.props.make_mut().children.push(child);
        self
    }

    #[must_use]
    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.props.make_mut().children.extend(children);
        self
    }

    /// Replace the props wholesale, keeping type, key and ref.
    #[must_use]
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn element_type(&self) -> &ElementType {
        &self.ty
    }

    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref()
    }

    #[must_use]
    pub fn props(&self) -> &Props {
        &self.props
    }

    /// Identity comparison: same type and the very same props.
    #[must_use]
    pub fn ptr_eq(&self, other: &Element) -> bool {
        self.props.ptr_eq(&other.props) && self.ty.same_type(&other.ty) && self.key == other.key
    }

    pub(crate) fn is_unkeyed_fragment(&self) -> bool {
        matches!(self.ty, ElementType::Fragment) && self.key.is_none()
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Element");
        d.field("type", &self.ty);
        if let Some(key) = &self.key {
            d.field("key", key);
        }
        d.field("props", &self.props).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_shares_props_until_mutated() {
        let a = Element::host("div").attr("id", "x");
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        let c = b.attr("id", "y");
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.props().get("id"), Some(&PropValue::from("x")));
    }

    #[test]
    fn host_types_compare_by_tag() {
        let a = Element::host("div");
        let b = Element::host("div");
        let c = Element::host("span");
        assert!(a.element_type().same_type(b.element_type()));
        assert!(!a.element_type().same_type(c.element_type()));
    }

    #[test]
    fn empty_is_an_unkeyed_fragment() {
        let e = Element::empty();
        assert!(e.is_unkeyed_fragment());
        assert!(e.props().children().is_empty());
        assert!(!Element::fragment(vec![]).key("k").is_unkeyed_fragment());
    }

    #[test]
    fn refs_downcast_to_stored_type() {
        let r = RefObject::new();
        assert!(!r.is_attached());
        r.set(Some(Rc::new(5u32)));
        assert_eq!(r.get::<u32>().as_deref(), Some(&5));
        assert!(r.get::<String>().is_none());
    }
}
