#![forbid(unsafe_code)]

//! In-memory host tree.
//!
//! [`TestHost`] implements [`HostConfig`] over a plain node table. Every
//! primitive the reconciler calls is appended to an operation log, and the
//! host checks the ordering rules of the host contract as it goes:
//!
//! | Rule | Recorded as |
//! |------|-------------|
//! | Attached-tree mutations happen between `prepare_for_commit` and `reset_after_commit` | violation |
//! | `append_initial_child` only targets detached parents | violation |
//! | Removed children were attached to the parent they are removed from | violation |
//!
//! Tests assert on [`TestHost::violations`] being empty, on the log, or on
//! the markup produced by [`TestHost::markup`].

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use fibra_core::attribute_payload::{ViewConfig, diff_props};
use fibra_core::{HostChild, HostConfig, PropMap, PropValue};

/// Attribute that makes an instance render its text directly.
pub const TEXT_CONTENT: &str = "text_content";

/// Handle to a host node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(u32);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container{}", self.0)
    }
}

/// Host context: the type of the closest host ancestor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestContext {
    pub parent_type: Option<Rc<str>>,
}

/// One host primitive call.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    CreateInstance { node: NodeId, ty: String },
    CreateText { node: NodeId, text: String },
    AppendInitialChild { parent: NodeId, child: NodeId },
    PrepareForCommit { container: ContainerId },
    ResetAfterCommit { container: ContainerId },
    AppendChild { parent: NodeId, child: NodeId },
    AppendToContainer { container: ContainerId, child: NodeId },
    InsertBefore { parent: NodeId, child: NodeId, before: NodeId },
    InsertInContainerBefore { container: ContainerId, child: NodeId, before: NodeId },
    RemoveChild { parent: NodeId, child: NodeId },
    RemoveFromContainer { container: ContainerId, child: NodeId },
    CommitMount { node: NodeId },
    CommitUpdate { node: NodeId, changed: Vec<String> },
    CommitTextUpdate { node: NodeId, text: String },
    ResetTextContent { node: NodeId },
    Hide { node: NodeId },
    Unhide { node: NodeId },
    ClearContainer { container: ContainerId },
}

impl HostOp {
    /// True for primitives that change the attached tree.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::CreateInstance { .. }
                | Self::CreateText { .. }
                | Self::AppendInitialChild { .. }
                | Self::PrepareForCommit { .. }
                | Self::ResetAfterCommit { .. }
        )
    }

    /// True for insertions and moves.
    #[must_use]
    pub fn is_placement(&self) -> bool {
        matches!(
            self,
            Self::AppendChild { .. }
                | Self::AppendToContainer { .. }
                | Self::InsertBefore { .. }
                | Self::InsertInContainerBefore { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parent {
    Node(NodeId),
    Container(ContainerId),
}

#[derive(Debug, Clone)]
struct NodeData {
    /// `None` for text nodes.
    ty: Option<Rc<str>>,
    props: PropMap,
    text: String,
    children: Vec<NodeId>,
    parent: Option<Parent>,
    hidden: bool,
}

/// In-memory [`HostConfig`] with an operation log.
#[derive(Debug)]
pub struct TestHost {
    nodes: BTreeMap<NodeId, NodeData>,
    containers: BTreeMap<ContainerId, Vec<NodeId>>,
    next_node: u32,
    next_container: u32,
    view_config: ViewConfig,
    log: Vec<HostOp>,
    commit_depth: u32,
    commits: u32,
    violations: Vec<String>,
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            containers: BTreeMap::new(),
            next_node: 0,
            next_container: 0,
            view_config: ViewConfig::permissive(),
            log: Vec::new(),
            commit_depth: 0,
            commits: 0,
            violations: Vec::new(),
        }
    }

    /// Use `config` when diffing props in `prepare_update`.
    #[must_use]
    pub fn with_view_config(mut self, config: ViewConfig) -> Self {
        self.view_config = config;
        self
    }

    /// Allocate an empty container.
    pub fn create_container(&mut self) -> ContainerId {
        self.next_container += 1;
        let id = ContainerId(self.next_container);
        self.containers.insert(id, Vec::new());
        id
    }

    // -- inspection ---------------------------------------------------------

    /// Operations recorded since the last [`TestHost::take_log`].
    #[must_use]
    pub fn log(&self) -> &[HostOp] {
        &self.log
    }

    pub fn take_log(&mut self) -> Vec<HostOp> {
        std::mem::take(&mut self.log)
    }

    /// Contract violations observed so far.
    #[must_use]
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Completed `prepare_for_commit`/`reset_after_commit` brackets.
    #[must_use]
    pub fn commit_count(&self) -> u32 {
        self.commits
    }

    #[must_use]
    pub fn container_children(&self, container: ContainerId) -> Vec<NodeId> {
        self.containers.get(&container).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn node_type(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(&node).and_then(|n| n.ty.as_deref())
    }

    #[must_use]
    pub fn prop(&self, node: NodeId, name: &str) -> Option<&PropValue> {
        self.nodes.get(&node).and_then(|n| n.props.get(name))
    }

    #[must_use]
    pub fn text(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(&node).map(|n| n.text.as_str())
    }

    #[must_use]
    pub fn is_hidden(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|n| n.hidden)
    }

    /// Nodes ever created, attached or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// First attached node under `container` whose `name` attribute equals `value`.
    #[must_use]
    pub fn find(&self, container: ContainerId, name: &str, value: &str) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.container_children(container);
        stack.reverse();
        while let Some(id) = stack.pop() {
            let node = self.nodes.get(&id)?;
            if node.props.get(name).and_then(PropValue::as_str) == Some(value) {
                return Some(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        None
    }

    /// Invoke the callback attribute `name` of `node` with `arg`.
    ///
    /// Returns `false` if the node has no such callback.
    pub fn dispatch(&self, node: NodeId, name: &str, arg: &PropValue) -> bool {
        match self.prop(node, name).cloned() {
            Some(cb @ PropValue::Callback(_)) => {
                cb.call(arg);
                true
            }
            _ => false,
        }
    }

    /// Visible text under `container`, concatenated in tree order.
    #[must_use]
    pub fn text_content(&self, container: ContainerId) -> String {
        let mut out = String::new();
        for id in self.container_children(container) {
            self.collect_text(id, &mut out);
        }
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else { return };
        if node.hidden {
            return;
        }
        out.push_str(&node.text);
        for child in &node.children {
            self.collect_text(*child, out);
        }
    }

    /// Serialize `container` as compact markup, e.g. `<div id="a">hi</div>`.
    ///
    /// Attributes are sorted by name; callbacks and opaque values are
    /// omitted; hidden instances carry a bare `hidden` attribute and hidden
    /// text renders empty.
    #[must_use]
    pub fn markup(&self, container: ContainerId) -> String {
        let mut out = String::new();
        for id in self.container_children(container) {
            self.write_markup(id, &mut out);
        }
        out
    }

    fn write_markup(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else { return };
        let Some(ty) = &node.ty else {
            if !node.hidden {
                out.push_str(&node.text);
            }
            return;
        };
        out.push('<');
        out.push_str(ty);
        for (name, value) in &node.props {
            if name == TEXT_CONTENT {
                continue;
            }
            if let Some(v) = markup_value(value) {
                out.push(' ');
                out.push_str(name);
                out.push('=');
                out.push_str(&v);
            }
        }
        if node.hidden {
            out.push_str(" hidden");
        }
        if node.children.is_empty() && node.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&node.text);
        for child in &node.children {
            self.write_markup(*child, out);
        }
        out.push_str("</");
        out.push_str(ty);
        out.push('>');
    }

    // -- bookkeeping --------------------------------------------------------

    fn alloc(&mut self, data: NodeData) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        self.nodes.insert(id, data);
        id
    }

    fn require_commit(&mut self, what: &str) {
        if self.commit_depth == 0 {
            self.violations.push(format!("{what} outside a commit"));
        }
    }

    fn child_id(child: HostChild<'_, Self>) -> NodeId {
        match child {
            HostChild::Instance(id) | HostChild::Text(id) => *id,
        }
    }

    fn detach(&mut self, child: NodeId) {
        let parent = self.nodes.get_mut(&child).and_then(|n| n.parent.take());
        match parent {
            Some(Parent::Node(p)) => {
                if let Some(p) = self.nodes.get_mut(&p) {
                    p.children.retain(|c| *c != child);
                }
            }
            Some(Parent::Container(c)) => {
                if let Some(list) = self.containers.get_mut(&c) {
                    list.retain(|n| *n != child);
                }
            }
            None => {}
        }
    }

    fn attach(&mut self, parent: Parent, child: NodeId, before: Option<NodeId>) {
        self.detach(child);
        let list = match parent {
            Parent::Node(p) => self.nodes.get_mut(&p).map(|n| &mut n.children),
            Parent::Container(c) => self.containers.get_mut(&c),
        };
        let Some(list) = list else {
            self.violations.push(format!("insert into unknown parent {parent:?}"));
            return;
        };
        match before.and_then(|b| list.iter().position(|n| *n == b)) {
            Some(index) => list.insert(index, child),
            None => {
                if let Some(b) = before {
                    self.violations
                        .push(format!("insert {child} before {b}, which is not a child of {parent:?}"));
                }
                list.push(child);
            }
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
    }

    fn remove(&mut self, parent: Parent, child: NodeId) {
        let attached_here = self.nodes.get(&child).and_then(|n| n.parent) == Some(parent);
        if !attached_here {
            self.violations
                .push(format!("remove {child} from {parent:?}, which is not its parent"));
        }
        self.detach(child);
    }

    fn set_hidden(&mut self, node: NodeId, hidden: bool) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.hidden = hidden;
        }
    }
}

fn markup_value(value: &PropValue) -> Option<String> {
    match value {
        PropValue::Null | PropValue::Callback(_) | PropValue::Opaque(_) => None,
        PropValue::Str(s) => Some(format!("{s:?}")),
        PropValue::Bool(b) => Some(b.to_string()),
        PropValue::Int(i) => Some(i.to_string()),
        PropValue::Float(f) => Some(f.to_string()),
        other => Some(format!("{other:?}")),
    }
}

impl HostConfig for TestHost {
    type Instance = NodeId;
    type TextInstance = NodeId;
    type Container = ContainerId;
    type UpdatePayload = PropMap;
    type HostContext = TestContext;
    type PublicInstance = NodeId;

    fn root_host_context(&self, _container: &ContainerId) -> TestContext {
        TestContext::default()
    }

    fn child_host_context(&self, _parent: &TestContext, ty: &str) -> TestContext {
        TestContext {
            parent_type: Some(Rc::from(ty)),
        }
    }

    fn should_set_text_content(&self, _ty: &str, props: &PropMap) -> bool {
        props.get(TEXT_CONTENT).and_then(PropValue::as_str).is_some()
    }

    fn create_instance(
        &mut self,
        ty: &str,
        props: &PropMap,
        _container: &ContainerId,
        _context: &TestContext,
    ) -> NodeId {
        let text = props
            .get(TEXT_CONTENT)
            .and_then(PropValue::as_str)
            .unwrap_or_default()
            .to_owned();
        let node = self.alloc(NodeData {
            ty: Some(Rc::from(ty)),
            props: props.clone(),
            text,
            children: Vec::new(),
            parent: None,
            hidden: false,
        });
        self.log.push(HostOp::CreateInstance {
            node,
            ty: ty.to_owned(),
        });
        node
    }

    fn create_text_instance(&mut self, text: &str, _container: &ContainerId, _context: &TestContext) -> NodeId {
        let node = self.alloc(NodeData {
            ty: None,
            props: PropMap::new(),
            text: text.to_owned(),
            children: Vec::new(),
            parent: None,
            hidden: false,
        });
        self.log.push(HostOp::CreateText {
            node,
            text: text.to_owned(),
        });
        node
    }

    fn append_initial_child(&mut self, parent: &NodeId, child: HostChild<'_, Self>) {
        let child = Self::child_id(child);
        if self.nodes.get(parent).is_some_and(|n| n.parent.is_some()) {
            self.violations
                .push(format!("append_initial_child into attached parent {parent}"));
        }
        self.attach(Parent::Node(*parent), child, None);
        self.log.push(HostOp::AppendInitialChild {
            parent: *parent,
            child,
        });
    }

    fn finalize_initial_children(
        &mut self,
        _instance: &NodeId,
        _ty: &str,
        props: &PropMap,
        _context: &TestContext,
    ) -> bool {
        props.get("auto_focus").and_then(PropValue::as_bool) == Some(true)
    }

    fn prepare_update(
        &mut self,
        _instance: &NodeId,
        _ty: &str,
        old_props: &PropMap,
        new_props: &PropMap,
        _context: &TestContext,
    ) -> Option<PropMap> {
        diff_props(old_props, new_props, &self.view_config)
    }

    fn public_instance(&self, instance: &NodeId) -> NodeId {
        *instance
    }

    fn prepare_for_commit(&mut self, container: &ContainerId) {
        self.commit_depth += 1;
        self.log.push(HostOp::PrepareForCommit { container: *container });
    }

    fn reset_after_commit(&mut self, container: &ContainerId) {
        if self.commit_depth == 0 {
            self.violations
                .push("reset_after_commit without prepare_for_commit".to_owned());
        } else {
            self.commit_depth -= 1;
            self.commits += 1;
        }
        self.log.push(HostOp::ResetAfterCommit { container: *container });
    }

    fn append_child(&mut self, parent: &NodeId, child: HostChild<'_, Self>) {
        self.require_commit("append_child");
        let child = Self::child_id(child);
        self.attach(Parent::Node(*parent), child, None);
        self.log.push(HostOp::AppendChild {
            parent: *parent,
            child,
        });
    }

    fn append_child_to_container(&mut self, container: &ContainerId, child: HostChild<'_, Self>) {
        self.require_commit("append_child_to_container");
        let child = Self::child_id(child);
        self.attach(Parent::Container(*container), child, None);
        self.log.push(HostOp::AppendToContainer {
            container: *container,
            child,
        });
    }

    fn insert_before(&mut self, parent: &NodeId, child: HostChild<'_, Self>, before: HostChild<'_, Self>) {
        self.require_commit("insert_before");
        let (child, before) = (Self::child_id(child), Self::child_id(before));
        self.attach(Parent::Node(*parent), child, Some(before));
        self.log.push(HostOp::InsertBefore {
            parent: *parent,
            child,
            before,
        });
    }

    fn insert_in_container_before(
        &mut self,
        container: &ContainerId,
        child: HostChild<'_, Self>,
        before: HostChild<'_, Self>,
    ) {
        self.require_commit("insert_in_container_before");
        let (child, before) = (Self::child_id(child), Self::child_id(before));
        self.attach(Parent::Container(*container), child, Some(before));
        self.log.push(HostOp::InsertInContainerBefore {
            container: *container,
            child,
            before,
        });
    }

    fn remove_child(&mut self, parent: &NodeId, child: HostChild<'_, Self>) {
        self.require_commit("remove_child");
        let child = Self::child_id(child);
        self.remove(Parent::Node(*parent), child);
        self.log.push(HostOp::RemoveChild {
            parent: *parent,
            child,
        });
    }

    fn remove_child_from_container(&mut self, container: &ContainerId, child: HostChild<'_, Self>) {
        self.require_commit("remove_child_from_container");
        let child = Self::child_id(child);
        self.remove(Parent::Container(*container), child);
        self.log.push(HostOp::RemoveFromContainer {
            container: *container,
            child,
        });
    }

    fn commit_mount(&mut self, instance: &NodeId, _ty: &str, _props: &PropMap) {
        self.require_commit("commit_mount");
        self.log.push(HostOp::CommitMount { node: *instance });
    }

    fn commit_update(&mut self, instance: &NodeId, payload: PropMap, _ty: &str, _old: &PropMap, _new: &PropMap) {
        self.require_commit("commit_update");
        let changed: Vec<String> = payload.keys().cloned().collect();
        if let Some(node) = self.nodes.get_mut(instance) {
            for (key, value) in payload {
                if key == TEXT_CONTENT {
                    node.text = value.as_str().unwrap_or_default().to_owned();
                }
                if value.is_null() {
                    node.props.remove(&key);
                } else {
                    node.props.insert(key, value);
                }
            }
        }
        self.log.push(HostOp::CommitUpdate {
            node: *instance,
            changed,
        });
    }

    fn commit_text_update(&mut self, text: &NodeId, _old_text: &str, new_text: &str) {
        self.require_commit("commit_text_update");
        if let Some(node) = self.nodes.get_mut(text) {
            new_text.clone_into(&mut node.text);
        }
        self.log.push(HostOp::CommitTextUpdate {
            node: *text,
            text: new_text.to_owned(),
        });
    }

    fn reset_text_content(&mut self, instance: &NodeId) {
        self.require_commit("reset_text_content");
        if let Some(node) = self.nodes.get_mut(instance) {
            node.text.clear();
        }
        self.log.push(HostOp::ResetTextContent { node: *instance });
    }

    fn hide_instance(&mut self, instance: &NodeId) {
        self.require_commit("hide_instance");
        self.set_hidden(*instance, true);
        self.log.push(HostOp::Hide { node: *instance });
    }

    fn unhide_instance(&mut self, instance: &NodeId, _props: &PropMap) {
        self.require_commit("unhide_instance");
        self.set_hidden(*instance, false);
        self.log.push(HostOp::Unhide { node: *instance });
    }

    fn hide_text_instance(&mut self, text: &NodeId) {
        self.require_commit("hide_text_instance");
        self.set_hidden(*text, true);
        self.log.push(HostOp::Hide { node: *text });
    }

    fn unhide_text_instance(&mut self, text: &NodeId, content: &str) {
        self.require_commit("unhide_text_instance");
        if let Some(node) = self.nodes.get_mut(text) {
            node.hidden = false;
            content.clone_into(&mut node.text);
        }
        self.log.push(HostOp::Unhide { node: *text });
    }

    fn clear_container(&mut self, container: &ContainerId) {
        self.require_commit("clear_container");
        for child in self.container_children(*container) {
            self.detach(child);
        }
        self.log.push(HostOp::ClearContainer { container: *container });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> PropMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), PropValue::from(*v)))
            .collect()
    }

    #[test]
    fn markup_reflects_attached_tree() {
        let mut host = TestHost::new();
        let c = host.create_container();
        let ctx = TestContext::default();
        let div = host.create_instance("div", &props(&[("id", "a")]), &c, &ctx);
        let text = host.create_text_instance("hi", &c, &ctx);
        host.append_initial_child(&div, HostChild::Text(&text));
        host.prepare_for_commit(&c);
        host.append_child_to_container(&c, HostChild::Instance(&div));
        host.reset_after_commit(&c);
        assert_eq!(host.markup(c), r#"<div id="a">hi</div>"#);
        assert_eq!(host.text_content(c), "hi");
        assert!(host.violations().is_empty());
        assert_eq!(host.commit_count(), 1);
    }

    #[test]
    fn mutation_outside_commit_is_a_violation() {
        let mut host = TestHost::new();
        let c = host.create_container();
        let div = host.create_instance("div", &PropMap::new(), &c, &TestContext::default());
        host.append_child_to_container(&c, HostChild::Instance(&div));
        assert_eq!(host.violations().len(), 1);
    }

    #[test]
    fn insert_before_orders_children() {
        let mut host = TestHost::new();
        let c = host.create_container();
        let ctx = TestContext::default();
        let a = host.create_text_instance("a", &c, &ctx);
        let b = host.create_text_instance("b", &c, &ctx);
        host.prepare_for_commit(&c);
        host.append_child_to_container(&c, HostChild::Text(&a));
        host.insert_in_container_before(&c, HostChild::Text(&b), HostChild::Text(&a));
        host.reset_after_commit(&c);
        assert_eq!(host.text_content(c), "ba");
    }

    #[test]
    fn commit_update_applies_payload() {
        let mut host = TestHost::new();
        let c = host.create_container();
        let ctx = TestContext::default();
        let old = props(&[("id", "a"), ("title", "x")]);
        let new = props(&[("id", "b")]);
        let div = host.create_instance("div", &old, &c, &ctx);
        let payload = host.prepare_update(&div, "div", &old, &new, &ctx);
        let Some(payload) = payload else {
            panic!("expected a payload");
        };
        host.prepare_for_commit(&c);
        host.append_child_to_container(&c, HostChild::Instance(&div));
        host.commit_update(&div, payload, "div", &old, &new);
        host.reset_after_commit(&c);
        assert_eq!(host.markup(c), r#"<div id="b"/>"#);
    }

    #[test]
    fn hidden_nodes_drop_out_of_text() {
        let mut host = TestHost::new();
        let c = host.create_container();
        let t = host.create_text_instance("x", &c, &TestContext::default());
        host.prepare_for_commit(&c);
        host.append_child_to_container(&c, HostChild::Text(&t));
        host.hide_text_instance(&t);
        host.reset_after_commit(&c);
        assert_eq!(host.text_content(c), "");
        assert!(host.is_hidden(t));
    }
}
