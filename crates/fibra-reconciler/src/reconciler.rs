#![forbid(unsafe_code)]

//! The reconciler and its public container API.
//!
//! A [`Reconciler`] owns one fiber arena shared by every root it manages,
//! the host bindings, and the handle to the embedder's scheduler. All work
//! enters through a small set of methods:
//!
//! | Entry point | Purpose |
//! |-------------|---------|
//! | [`Reconciler::create_container`] | Register a container, get a [`RootId`] |
//! | [`Reconciler::update_container`] | Schedule a new element for a root |
//! | [`Reconciler::render`] | Legacy one-shot: find or create a root and render synchronously |
//! | [`Reconciler::unmount`] | Tear a root down synchronously |
//! | [`Reconciler::flush_sync`] | Run a closure and commit its updates before returning |
//! | [`Reconciler::batched_updates`] | Defer scheduling until the closure returns |
//! | [`Reconciler::start_transition`] | Run a closure whose updates get transition lanes |
//! | [`Reconciler::run_task`] | Execute a [`Task`] the scheduler was asked to run |
//!
//! Handles given to components (state setters, class updaters, wakeable
//! listeners) post to a shared inbox; every entry point drains it first.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Entry point called from inside a render or commit | `Err(AlreadyWorking)` |
//! | Unknown root handle | `Err(UnknownRoot)` |
//! | Invariant violation while rendering | Render discarded, `Err` returned |

use std::cell::RefCell;
use std::rc::Rc;

use fibra_core::{
    EventPriority, FiberId, HostConfig, HostNode, HostNodeId, Lane, Lanes, Mode, PortalId,
    ReconcilerConfig, ReconcilerError, RootId, RootLanes, Scheduler, Task, TaskStatus,
};
use slotmap::{SecondaryMap, SlotMap};

use crate::class_component::ClassInstance;
use crate::element::{Element, Props};
use crate::fiber::{Fiber, FiberKind, FiberQueue, FiberRoot, MemoState, RootTag, StateNode};
use crate::observer::{NoopObserver, ReconcilerObserver};
use crate::passive::PendingPassive;
use crate::shared::{ExecutionContext, Shared};
use crate::update_queue::{Payload, RootState, Update, UpdateCallback, UpdateQueue};
use crate::work_loop::{RenderSession, GC_MIN_FIBERS};

/// Incremental fiber reconciler over a host `H`.
pub struct Reconciler<H: HostConfig> {
    pub(crate) host: H,
    pub(crate) config: ReconcilerConfig,
    pub(crate) shared: Rc<Shared>,
    pub(crate) observer: Box<dyn ReconcilerObserver>,

    pub(crate) fibers: SlotMap<FiberId, Fiber>,
    pub(crate) roots: SlotMap<RootId, FiberRoot<H>>,
    pub(crate) host_nodes: SlotMap<HostNodeId, HostNode<H>>,
    /// Update payloads prepared during completion, consumed at commit.
    pub(crate) host_payloads: SecondaryMap<FiberId, H::UpdatePayload>,
    pub(crate) portals: SlotMap<PortalId, H::Container>,

    pub(crate) session: RenderSession<H>,

    pub(crate) sync_queue: Vec<RootId>,
    pub(crate) sync_flush_scheduled: bool,
    pub(crate) flushing_sync_queue: bool,
    pub(crate) nested_update_count: u32,
    pub(crate) root_with_nested_updates: Option<RootId>,
    pub(crate) nested_passive_update_count: u32,
    pub(crate) root_with_passive_nested_updates: Option<RootId>,

    pub(crate) pending_passive: Option<PendingPassive>,
    pub(crate) passive_scheduled: bool,
    /// Boundaries that rendered nothing after an error; cleared once their
    /// root has no pending work.
    pub(crate) failed_boundaries: Vec<Rc<RefCell<ClassInstance>>>,
    pub(crate) most_recent_fallback_time: fibra_core::Timestamp,

    pub(crate) gc_pending: bool,
    pub(crate) gc_watermark: usize,
}

impl<H: HostConfig> Reconciler<H> {
    pub fn new(host: H, scheduler: Rc<dyn Scheduler>, config: ReconcilerConfig) -> Self {
        Self {
            host,
            config,
            shared: Rc::new(Shared::new(scheduler)),
            observer: Box::new(NoopObserver),
            fibers: SlotMap::with_key(),
            roots: SlotMap::with_key(),
            host_nodes: SlotMap::with_key(),
            host_payloads: SecondaryMap::new(),
            portals: SlotMap::with_key(),
            session: RenderSession::default(),
            sync_queue: Vec::new(),
            sync_flush_scheduled: false,
            flushing_sync_queue: false,
            nested_update_count: 0,
            root_with_nested_updates: None,
            nested_passive_update_count: 0,
            root_with_passive_nested_updates: None,
            pending_passive: None,
            passive_scheduled: false,
            failed_boundaries: Vec::new(),
            most_recent_fallback_time: 0,
            gc_pending: false,
            gc_watermark: GC_MIN_FIBERS,
        }
    }

    /// Replace the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: impl ReconcilerObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    // -- containers ---------------------------------------------------------

    /// Register `container` as a new root.
    pub fn create_container(&mut self, container: H::Container, tag: RootTag) -> RootId {
        let mut mode = Mode::empty();
        if tag == RootTag::Concurrent {
            mode |= Mode::CONCURRENT;
        }
        if self.config.profiling {
            mode |= Mode::PROFILE;
        }
        let mut fiber = Fiber::new(FiberKind::HostRoot, None, None, Props::default(), mode);
        fiber.memoized_props = Some(fiber.pending_props.clone());
        fiber.memoized_state = MemoState::Root(RootState::default());
        fiber.update_queue = FiberQueue::Root(UpdateQueue::new(RootState::default()));
        let current = self.fibers.insert(fiber);
        let root = self.roots.insert(FiberRoot {
            tag,
            container,
            current,
            lanes: RootLanes::new(),
            callback_node: None,
            callback_priority: Lanes::NONE,
            finished_work: None,
            finished_lanes: Lanes::NONE,
            timeout_handle: None,
            ping_cache: ahash::AHashMap::new(),
            recoverable_errors: Vec::new(),
        });
        self.fibers[current].state_node = StateNode::Root(root);
        tracing::debug!(target: "fibra.root", ?root, ?tag, "container created");
        root
    }

    /// Register a secondary container that portals can render into.
    pub fn create_portal(&mut self, container: H::Container) -> PortalId {
        self.portals.insert(container)
    }

    /// Schedule `element` as the new content of `root`; returns the lane
    /// the update was given.
    pub fn update_container(&mut self, root: RootId, element: Element) -> Result<Lane, ReconcilerError> {
        self.update_container_impl(root, Some(element), None)
    }

    /// Like [`Reconciler::update_container`], running `callback` once the
    /// update commits.
    pub fn update_container_then(
        &mut self,
        root: RootId,
        element: Element,
        callback: impl FnOnce() + 'static,
    ) -> Result<Lane, ReconcilerError> {
        self.update_container_impl(root, Some(element), Some(UpdateCallback::user(callback)))
    }

    fn update_container_impl(
        &mut self,
        root: RootId,
        element: Option<Element>,
        callback: Option<UpdateCallback>,
    ) -> Result<Lane, ReconcilerError> {
        self.drain_inbox()?;
        let current = self.roots.get(root).ok_or(ReconcilerError::UnknownRoot)?.current;
        let lane = self.shared.request_update_lane(self.fibers[current].mode);
        let now = self.shared.now();
        let update = Update::<RootState>::new(lane, now, Payload::Partial(element)).with_callback(callback);
        self.enqueue_update(current, update);
        let queue = match &self.fibers[current].update_queue {
            FiberQueue::Root(q) => Some(q.shared.clone()),
            _ => None,
        };
        tracing::debug!(target: "fibra.root", ?root, lane = %lane, "container update scheduled");
        if let Some(scheduled) = self.schedule_update_on_fiber(current, lane, now)?
            && let Some(queue) = queue
        {
            self.entangle_transitions(scheduled, queue.as_ref(), lane);
        }
        Ok(lane)
    }

    /// Render `element` into `container` synchronously, reusing the legacy
    /// root already bound to it.
    pub fn render(&mut self, element: Element, container: H::Container) -> Result<RootId, ReconcilerError> {
        let existing = self
            .roots
            .iter()
            .find(|(_, r)| r.tag == RootTag::Legacy && r.container == container)
            .map(|(id, _)| id);
        let root = match existing {
            Some(root) => root,
            None => self.create_container(container, RootTag::Legacy),
        };
        self.flush_sync(|r| r.update_container(root, element))??;
        Ok(root)
    }

    /// Unmount everything rendered into `root` and forget the root.
    pub fn unmount(&mut self, root: RootId) -> Result<(), ReconcilerError> {
        if !self.roots.contains_key(root) {
            return Err(ReconcilerError::UnknownRoot);
        }
        self.flush_sync(|r| r.update_container_impl(root, None, None))??;
        while self.flush_passive_effects_impl()? {}
        if self.session.root == Some(root) {
            self.reset_session();
        }
        if let Some(r) = self.roots.remove(root) {
            for handle in r.callback_node.into_iter().chain(r.timeout_handle) {
                self.shared.scheduler.cancel_callback(handle);
            }
            self.sync_queue.retain(|id| *id != root);
            self.detach_deleted_subtree(r.current);
        }
        self.observer.on_unmount(root);
        tracing::debug!(target: "fibra.root", ?root, "root unmounted");
        Ok(())
    }

    /// Unmount the legacy root bound to `container`; `false` if none was.
    pub fn unmount_component_at_node(&mut self, container: &H::Container) -> Result<bool, ReconcilerError> {
        let root = self
            .roots
            .iter()
            .find(|(_, r)| r.tag == RootTag::Legacy && &r.container == container)
            .map(|(id, _)| id);
        match root {
            Some(root) => self.unmount(root).map(|()| true),
            None => Ok(false),
        }
    }

    // -- batching and priorities --------------------------------------------

    /// Run `f` with discrete priority and commit all sync work it caused
    /// before returning.
    pub fn flush_sync<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R, ReconcilerError> {
        if self.shared.is_working() {
            return Err(ReconcilerError::AlreadyWorking);
        }
        while self.flush_passive_effects_impl()? {}
        let prev_priority = self.shared.update_priority();
        self.shared.set_update_priority(Some(EventPriority::Discrete));
        let prev = self.shared.enter(ExecutionContext::BATCHED);
        let out = f(self);
        self.shared.set_execution(prev);
        let drained = self.drain_inbox();
        self.shared.set_update_priority(prev_priority);
        drained?;
        self.finish_entry()?;
        Ok(out)
    }

    /// Run `f`, scheduling the updates it makes only once it returns.
    pub fn batched_updates<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R, ReconcilerError> {
        let prev = self.shared.enter(ExecutionContext::BATCHED);
        let out = f(self);
        self.shared.set_execution(prev);
        self.drain_inbox()?;
        if prev.is_empty() {
            self.finish_entry()?;
        }
        Ok(out)
    }

    /// Run `f` with updates given `priority`.
    pub fn with_event_priority<R>(
        &mut self,
        priority: EventPriority,
        f: impl FnOnce(&mut Self) -> R,
    ) -> Result<R, ReconcilerError> {
        let prev = self.shared.update_priority();
        self.shared.set_update_priority(Some(priority));
        let out = f(self);
        let drained = self.drain_inbox();
        self.shared.set_update_priority(prev);
        drained?;
        self.finish_entry()?;
        Ok(out)
    }

    /// Run `f` with every update it makes on a transition lane.
    pub fn start_transition<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R, ReconcilerError> {
        let prev_priority = self.shared.update_priority();
        self.shared.set_update_priority(None);
        let prev = self.shared.set_in_transition(true);
        let out = f(self);
        let drained = self.drain_inbox();
        self.shared.set_in_transition(prev);
        self.shared.set_update_priority(prev_priority);
        drained?;
        self.finish_entry()?;
        Ok(out)
    }

    /// Run pending passive effects now; `false` if there were none.
    pub fn flush_passive_effects(&mut self) -> Result<bool, ReconcilerError> {
        self.drain_inbox()?;
        let flushed = self.flush_passive_effects_impl()?;
        self.finish_entry()?;
        Ok(flushed)
    }

    /// Apply updates handles dispatched since the last entry point.
    pub fn process_updates(&mut self) -> Result<(), ReconcilerError> {
        self.drain_inbox()?;
        self.finish_entry()
    }

    /// Flush sync work and close the current event once nothing is running.
    fn finish_entry(&mut self) -> Result<(), ReconcilerError> {
        if !self.shared.execution().is_empty() {
            return Ok(());
        }
        self.flush_sync_callbacks()?;
        self.drain_inbox()?;
        self.flush_sync_callbacks()?;
        self.shared.reset_event_transition_lane();
        Ok(())
    }

    // -- tasks --------------------------------------------------------------

    /// Execute a task previously handed to the scheduler.
    pub fn run_task(&mut self, task: Task) -> Result<TaskStatus, ReconcilerError> {
        if self.shared.is_working() {
            return Err(ReconcilerError::AlreadyWorking);
        }
        tracing::trace!(target: "fibra.root", task = task.name(), "running task");
        self.drain_inbox()?;
        let status = match task {
            Task::PerformWork(root) => self.run_perform_work(root)?,
            Task::FlushSyncQueue => {
                self.sync_flush_scheduled = false;
                self.flush_sync_callbacks()?;
                TaskStatus::Done
            }
            Task::FlushPassiveEffects => {
                self.flush_passive_effects_impl()?;
                TaskStatus::Done
            }
            Task::ProcessUpdates => TaskStatus::Done,
            Task::CommitSuspended(root) => {
                let ready = match self.roots.get_mut(root) {
                    Some(r) => {
                        r.timeout_handle = None;
                        r.finished_work.is_some()
                    }
                    None => false,
                };
                if ready {
                    self.commit_root(root)?;
                    self.ensure_root_is_scheduled(root);
                }
                TaskStatus::Done
            }
        };
        self.finish_entry()?;
        Ok(status)
    }

    fn run_perform_work(&mut self, root: RootId) -> Result<TaskStatus, ReconcilerError> {
        let Some(original) = self.roots.get(root).map(|r| r.callback_node) else {
            return Ok(TaskStatus::Done);
        };
        self.perform_concurrent_work_on_root(root)?;
        if self.session.root == Some(root) && self.session.wip.is_some() {
            return Ok(TaskStatus::Continue);
        }
        // This task is over; forget its handle so new work gets a fresh one.
        if let Some(r) = self.roots.get_mut(root)
            && r.callback_node == original
        {
            r.callback_node = None;
            r.callback_priority = Lanes::NONE;
            self.ensure_root_is_scheduled(root);
        }
        Ok(TaskStatus::Done)
    }

    // -- inspection ---------------------------------------------------------

    /// Lanes with work still pending on `root`.
    pub fn pending_lanes(&self, root: RootId) -> Result<Lanes, ReconcilerError> {
        self.roots
            .get(root)
            .map(|r| r.lanes.pending)
            .ok_or(ReconcilerError::UnknownRoot)
    }

    /// True while a render of `root` is started but not finished.
    #[must_use]
    pub fn is_rendering(&self, root: RootId) -> bool {
        self.session.root == Some(root) && self.session.wip.is_some()
    }

    /// True when passive effects of the last commit have not run yet.
    #[must_use]
    pub fn has_pending_passive_effects(&self) -> bool {
        self.pending_passive.is_some()
    }

    /// Container `root` renders into.
    #[must_use]
    pub fn container(&self, root: RootId) -> Option<&H::Container> {
        self.roots.get(root).map(|r| &r.container)
    }

    /// Live fibers in the arena, both trees included.
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// Host nodes currently owned by fibers.
    #[must_use]
    pub fn host_node_count(&self) -> usize {
        self.host_nodes.len()
    }

    /// Render the committed tree of `root` as an indented outline of fiber
    /// kinds, for debugging and tests.
    pub fn debug_tree(&self, root: RootId) -> Result<String, ReconcilerError> {
        let current = self.roots.get(root).ok_or(ReconcilerError::UnknownRoot)?.current;
        let mut out = String::new();
        let mut stack = vec![(current, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let f = &self.fibers[id];
            out.push_str(&"  ".repeat(depth));
            out.push_str(&f.kind.name());
            if let Some(key) = &f.key {
                out.push_str(&format!(" key={key}"));
            }
            if let Some(text) = f.memoized_props.as_ref().and_then(|p| p.text()) {
                out.push_str(&format!(" {text:?}"));
            }
            out.push('\n');
            for child in self.children_of(id).into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        Ok(out)
    }
}
