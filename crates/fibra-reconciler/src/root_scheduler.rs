#![forbid(unsafe_code)]

//! Root scheduling: from a lane on a fiber to a task on the scheduler.
//!
//! An update marks its lane on the fiber, on every ancestor's `child_lanes`
//! and on the root. [`Reconciler::ensure_root_is_scheduled`] then makes sure
//! the root has exactly one pending task matching its highest-priority
//! pending lane: sync work joins the sync queue, everything else becomes a
//! [`Task::PerformWork`] callback at the matching scheduler priority.
//!
//! # Invariants
//!
//! - A root has at most one outstanding `PerformWork` callback.
//! - A callback is replaced only when the priority of the next lanes
//!   changes; same-priority updates reuse it.
//! - Nested synchronous commits on one root are bounded by
//!   `nested_update_limit`.

use std::panic::{catch_unwind, AssertUnwindSafe};

use fibra_core::{
    EventPriority, FiberId, HostConfig, Lane, Lanes, ReconcilerError, RootId, SchedulerPriority, Task,
    Timestamp,
};

use crate::fiber::{FiberKind, StateNode};
use crate::reconciler::Reconciler;
use crate::shared::{EagerCandidate, ExecutionContext, InboxEntry};

impl<H: HostConfig> Reconciler<H> {
    /// Mark `lane` from `fiber` up to its root and schedule the root.
    pub(crate) fn schedule_update_on_fiber(
        &mut self,
        fiber: FiberId,
        lane: Lane,
        event_time: Timestamp,
    ) -> Result<Option<RootId>, ReconcilerError> {
        self.check_for_nested_updates()?;
        let Some(root) = self.mark_update_lane_from_fiber_to_root(fiber, lane) else {
            tracing::debug!(target: "fibra.root", lane = %lane, "update on an unmounted fiber ignored");
            return Ok(None);
        };
        self.roots[root].lanes.mark_root_updated(lane, event_time);

        let execution = self.shared.execution();
        if execution.contains(ExecutionContext::RENDER) && self.session.root == Some(root) {
            self.session.render_phase_updated_lanes |= lane;
            return Ok(Some(root));
        }
        if self.session.root == Some(root) {
            self.session.interleaved_updated_lanes |= lane;
            if self.session.exit_status == crate::work_loop::ExitStatus::SuspendedWithDelay {
                // The suspended render cannot finish before this update; mark
                // it suspended so the update wins.
                let lanes = self.session.render_lanes;
                self.mark_root_suspended(root, lanes);
            }
        }
        self.ensure_root_is_scheduled(root);
        if lane == Lanes::SYNC && execution.is_empty() && !self.roots[root].is_concurrent() {
            self.flush_sync_callbacks()?;
        }
        Ok(Some(root))
    }

    /// Propagate `lane` to `fiber`, its alternate and every ancestor.
    pub(crate) fn mark_update_lane_from_fiber_to_root(&mut self, fiber: FiberId, lane: Lane) -> Option<RootId> {
        let f = self.fibers.get_mut(fiber)?;
        f.lanes |= lane;
        let (alternate, mut parent) = (f.alternate, f.return_);
        if let Some(alt) = alternate
            && let Some(a) = self.fibers.get_mut(alt)
        {
            a.lanes |= lane;
        }
        let mut node = fiber;
        while let Some(p) = parent {
            let pf = self.fibers.get_mut(p)?;
            pf.child_lanes |= lane;
            let (alternate, next) = (pf.alternate, pf.return_);
            if let Some(alt) = alternate
                && let Some(a) = self.fibers.get_mut(alt)
            {
                a.child_lanes |= lane;
            }
            node = p;
            parent = next;
        }
        let top = &self.fibers[node];
        match (&top.kind, &top.state_node) {
            (FiberKind::HostRoot, StateNode::Root(root)) if self.roots.contains_key(*root) => Some(*root),
            _ => None,
        }
    }

    fn check_for_nested_updates(&mut self) -> Result<(), ReconcilerError> {
        if self.nested_update_count > self.config.nested_update_limit {
            let limit = self.config.nested_update_limit;
            self.nested_update_count = 0;
            self.root_with_nested_updates = None;
            tracing::error!(target: "fibra.root", limit, "maximum update depth exceeded");
            return Err(ReconcilerError::MaximumUpdateDepth { limit });
        }
        if self.nested_passive_update_count > self.config.nested_passive_update_limit {
            self.nested_passive_update_count = 0;
            self.root_with_passive_nested_updates = None;
            tracing::warn!(
                target: "fibra.root",
                limit = self.config.nested_passive_update_limit,
                "passive effects keep scheduling updates; check effect dependencies"
            );
        }
        Ok(())
    }

    /// Give `root` one task matching its next lanes, or none.
    pub(crate) fn ensure_root_is_scheduled(&mut self, root: RootId) {
        let now = self.shared.now();
        let windows = self.config.expiration_windows();
        let wip_lanes = if self.session.root == Some(root) {
            self.session.render_lanes
        } else {
            Lanes::NONE
        };
        let Some(r) = self.roots.get_mut(root) else { return };
        r.lanes.mark_starved_lanes_as_expired(now, &windows);
        let next = r.lanes.get_next_lanes(wip_lanes);
        let existing = r.callback_node;

        if next.is_empty() {
            if let Some(handle) = existing {
                self.shared.scheduler.cancel_callback(handle);
            }
            r.callback_node = None;
            r.callback_priority = Lanes::NONE;
            return;
        }

        let priority = next.highest_priority_lane();
        if r.callback_priority == priority {
            return;
        }
        if let Some(handle) = existing {
            self.shared.scheduler.cancel_callback(handle);
        }

        if priority == Lanes::SYNC {
            r.callback_node = None;
            r.callback_priority = priority;
            self.sync_queue.push(root);
            if !self.sync_flush_scheduled {
                self.sync_flush_scheduled = true;
                self.shared
                    .scheduler
                    .schedule_callback(SchedulerPriority::Immediate, Task::FlushSyncQueue, None);
            }
            tracing::trace!(target: "fibra.root", "root queued for sync flush");
        } else {
            let scheduler_priority = EventPriority::from_lanes(next).scheduler_priority();
            let handle = self
                .shared
                .scheduler
                .schedule_callback(scheduler_priority, Task::PerformWork(root), None);
            r.callback_node = Some(handle);
            r.callback_priority = priority;
            tracing::trace!(
                target: "fibra.root",
                lanes = %next,
                priority = ?scheduler_priority,
                handle = %handle,
                "scheduled concurrent work"
            );
        }
    }

    /// Render and commit every root waiting on the sync lane.
    pub(crate) fn flush_sync_callbacks(&mut self) -> Result<(), ReconcilerError> {
        if self.flushing_sync_queue || self.sync_queue.is_empty() {
            return Ok(());
        }
        self.flushing_sync_queue = true;
        let prev_priority = self.shared.update_priority();
        self.shared.set_update_priority(Some(EventPriority::Discrete));

        let mut result = Ok(());
        let mut index = 0;
        while index < self.sync_queue.len() {
            let root = self.sync_queue[index];
            if let Err(error) = self.perform_sync_work_on_root(root) {
                // Keep the roots after the failing one for the next flush.
                self.sync_queue.drain(..=index);
                result = Err(error);
                break;
            }
            index += 1;
        }
        if result.is_ok() {
            self.sync_queue.clear();
        } else if !self.sync_queue.is_empty() && !self.sync_flush_scheduled {
            self.sync_flush_scheduled = true;
            self.shared
                .scheduler
                .schedule_callback(SchedulerPriority::Immediate, Task::FlushSyncQueue, None);
        }

        self.shared.set_update_priority(prev_priority);
        self.flushing_sync_queue = false;
        result
    }

    /// Apply everything handles posted since the last drain.
    pub(crate) fn drain_inbox(&mut self) -> Result<(), ReconcilerError> {
        self.shared.clear_process_scheduled();
        while let Some(entry) = self.shared.next_entry() {
            match entry {
                InboxEntry::Update {
                    fiber,
                    lane,
                    event_time,
                    queue,
                    eager,
                } => {
                    if let Some(candidate) = eager
                        && self.try_eager_bailout(fiber, &candidate)
                    {
                        continue;
                    }
                    if let Some(root) = self.schedule_update_on_fiber(fiber, lane, event_time)? {
                        self.entangle_transitions(root, queue.as_ref(), lane);
                    }
                }
                InboxEntry::ForceSync { fiber } => {
                    let now = self.shared.now();
                    self.schedule_update_on_fiber(fiber, Lanes::SYNC, now)?;
                }
                InboxEntry::Ping { root, wakeable, lanes } => self.ping_suspended_root(root, wakeable, lanes),
                InboxEntry::Retry { boundary, wakeable } => self.retry_timed_out_boundary(boundary, wakeable),
            }
        }
        Ok(())
    }

    /// Compute a state update eagerly; true if it changes nothing and can
    /// skip scheduling.
    fn try_eager_bailout(&self, fiber: FiberId, candidate: &EagerCandidate) -> bool {
        if !self.config.eager_state_bailout {
            return false;
        }
        let Some(f) = self.fibers.get(fiber) else {
            return false;
        };
        let alternate_busy = f
            .alternate
            .and_then(|a| self.fibers.get(a))
            .is_some_and(|a| !a.lanes.is_empty());
        if !f.lanes.is_empty() || alternate_busy {
            return false;
        }
        let queue = &candidate.queue;
        let reducer = queue.last_rendered_reducer.borrow().clone();
        let current = queue.last_rendered_state.borrow().clone();
        let Ok(eager) = catch_unwind(AssertUnwindSafe(|| reducer(&current, &candidate.update.action))) else {
            // The render will hit the same panic and route it to a boundary.
            return false;
        };
        let unchanged = (queue.state_eq)(eager.as_ref(), current.as_ref());
        *candidate.update.eager.borrow_mut() = Some(eager);
        if unchanged {
            tracing::trace!(target: "fibra.hooks", "eager state bailout");
        }
        unchanged
    }
}
