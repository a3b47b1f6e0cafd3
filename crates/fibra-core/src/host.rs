#![forbid(unsafe_code)]

//! Host configuration contract.
//!
//! The reconciler is host-agnostic. Everything it does to a real UI tree goes
//! through [`HostConfig`]: creation and initial assembly during completion,
//! and insertion/removal/update during the commit mutation phase.
//!
//! # Ordering guarantees
//!
//! - `create_instance`, `append_initial_child` and `prepare_update` run
//!   during render and may be discarded if the render is thrown away. They
//!   must not touch the attached tree.
//! - Everything named `commit_*`, `append_child*`, `insert_*`, `remove_*`,
//!   `hide_*`/`unhide_*` and `clear_container` runs only between
//!   `prepare_for_commit` and `reset_after_commit`.

use crate::props::PropMap;

/// Borrowed host node passed to mutation primitives.
pub enum HostChild<'a, H: HostConfig + ?Sized> {
    Instance(&'a H::Instance),
    Text(&'a H::TextInstance),
}

impl<H: HostConfig + ?Sized> Clone for HostChild<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: HostConfig + ?Sized> Copy for HostChild<'_, H> {}

/// Owned host node, shared by both alternates of a host fiber.
pub enum HostNode<H: HostConfig + ?Sized> {
    Instance(H::Instance),
    Text(H::TextInstance),
}

impl<H: HostConfig + ?Sized> Clone for HostNode<H> {
    fn clone(&self) -> Self {
        match self {
            Self::Instance(i) => Self::Instance(i.clone()),
            Self::Text(t) => Self::Text(t.clone()),
        }
    }
}

impl<H: HostConfig + ?Sized> HostNode<H> {
    #[must_use]
    pub fn as_child(&self) -> HostChild<'_, H> {
        match self {
            Self::Instance(i) => HostChild::Instance(i),
            Self::Text(t) => HostChild::Text(t),
        }
    }

    #[must_use]
    pub fn as_instance(&self) -> Option<&H::Instance> {
        match self {
            Self::Instance(i) => Some(i),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&H::TextInstance> {
        match self {
            Self::Text(t) => Some(t),
            Self::Instance(_) => None,
        }
    }
}

/// Mutation-mode host bindings.
pub trait HostConfig {
    type Instance: Clone + 'static;
    type TextInstance: Clone + 'static;
    type Container: Clone + PartialEq + 'static;
    type UpdatePayload: Clone + 'static;
    type HostContext: Clone + 'static;
    /// Value exposed to refs attached to host components.
    type PublicInstance: Clone + 'static;

    // -- context ------------------------------------------------------------

    fn root_host_context(&self, container: &Self::Container) -> Self::HostContext;

    fn child_host_context(&self, parent: &Self::HostContext, ty: &str) -> Self::HostContext;

    /// True if the instance renders its text from props and has no child fibers.
    fn should_set_text_content(&self, _ty: &str, _props: &PropMap) -> bool {
        false
    }

    // -- render phase -------------------------------------------------------

    fn create_instance(
        &mut self,
        ty: &str,
        props: &PropMap,
        container: &Self::Container,
        context: &Self::HostContext,
    ) -> Self::Instance;

    fn create_text_instance(
        &mut self,
        text: &str,
        container: &Self::Container,
        context: &Self::HostContext,
    ) -> Self::TextInstance;

    fn append_initial_child(&mut self, parent: &Self::Instance, child: HostChild<'_, Self>);

    /// Returns `true` to request [`HostConfig::commit_mount`] after insertion.
    fn finalize_initial_children(
        &mut self,
        _instance: &Self::Instance,
        _ty: &str,
        _props: &PropMap,
        _context: &Self::HostContext,
    ) -> bool {
        false
    }

    /// Compute the update for changed props, or `None` if nothing changed.
    fn prepare_update(
        &mut self,
        instance: &Self::Instance,
        ty: &str,
        old_props: &PropMap,
        new_props: &PropMap,
        context: &Self::HostContext,
    ) -> Option<Self::UpdatePayload>;

    fn public_instance(&self, instance: &Self::Instance) -> Self::PublicInstance;

    // -- commit phase -------------------------------------------------------

    fn prepare_for_commit(&mut self, _container: &Self::Container) {}

    fn reset_after_commit(&mut self, _container: &Self::Container) {}

    fn append_child(&mut self, parent: &Self::Instance, child: HostChild<'_, Self>);

    fn append_child_to_container(&mut self, container: &Self::Container, child: HostChild<'_, Self>);

    fn insert_before(
        &mut self,
        parent: &Self::Instance,
        child: HostChild<'_, Self>,
        before: HostChild<'_, Self>,
    );

    fn insert_in_container_before(
        &mut self,
        container: &Self::Container,
        child: HostChild<'_, Self>,
        before: HostChild<'_, Self>,
    );

    fn remove_child(&mut self, parent: &Self::Instance, child: HostChild<'_, Self>);

    fn remove_child_from_container(&mut self, container: &Self::Container, child: HostChild<'_, Self>);

    fn commit_mount(&mut self, _instance: &Self::Instance, _ty: &str, _props: &PropMap) {}

    fn commit_update(
        &mut self,
        instance: &Self::Instance,
        payload: Self::UpdatePayload,
        ty: &str,
        old_props: &PropMap,
        new_props: &PropMap,
    );

    fn commit_text_update(&mut self, text: &Self::TextInstance, old_text: &str, new_text: &str);

    fn reset_text_content(&mut self, _instance: &Self::Instance) {}

    fn hide_instance(&mut self, instance: &Self::Instance);

    fn unhide_instance(&mut self, instance: &Self::Instance, props: &PropMap);

    fn hide_text_instance(&mut self, text: &Self::TextInstance);

    fn unhide_text_instance(&mut self, text: &Self::TextInstance, content: &str);

    fn clear_container(&mut self, container: &Self::Container);
}
