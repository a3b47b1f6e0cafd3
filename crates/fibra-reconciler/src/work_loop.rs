#![forbid(unsafe_code)]

//! Render loop: fresh stacks, units of work, and root-level render outcomes.
//!
//! A render walks the work-in-progress tree depth first. `begin_work` runs on
//! the way down and may return a child; when it returns none the fiber is
//! completed and the walk moves to its sibling or back up to its parent.
//! Concurrent renders check [`Scheduler::should_yield`](fibra_core::Scheduler)
//! between units and may be resumed or thrown away.
//!
//! # Invariants
//!
//! - Exactly one render is in progress at a time; starting a render on a
//!   different root or with different lanes discards the current one.
//! - Every context pushed by `begin_work` is popped by `complete_work` or
//!   `unwind_work` on the same fiber.
//! - A render that errors in concurrent mode is retried once synchronously
//!   before its error is treated as final.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Invariant violation during render | Render discarded, lanes suspended, `Err` returned |
//! | Store changed during a sliced render | Root re-rendered synchronously before commit |
//! | Suspended on retry lanes inside the throttle window | Commit delayed via [`Task::CommitSuspended`] |

use fibra_core::{
    FiberId, Flags, HostConfig, Lanes, Mode, ReconcilerError, RootId, SchedulerPriority, Task,
    Timestamp,
};

use crate::context::ContextStack;
use crate::element::Props;
use crate::fiber::FiberQueue;
use crate::reconciler::Reconciler;
use crate::shared::ExecutionContext;
use crate::suspense::SuspenseContext;
use crate::throw::WorkError;
use crate::update_queue::CapturedError;

/// Minimum arena size before the collector runs on growth alone.
pub(crate) const GC_MIN_FIBERS: usize = 256;

/// How a render ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    InProgress,
    FatalErrored,
    Errored,
    Suspended,
    SuspendedWithDelay,
    Completed,
    /// The root itself was left incomplete (a non-sync render suspended
    /// with no boundary).
    DidNotComplete,
}

/// Everything scoped to one render attempt.
pub(crate) struct RenderSession<H: HostConfig> {
    pub(crate) root: Option<RootId>,
    pub(crate) wip: Option<FiberId>,
    pub(crate) render_lanes: Lanes,
    /// Render lanes plus lanes of hidden trees being revealed.
    pub(crate) subtree_render_lanes: Lanes,
    pub(crate) subtree_lanes_stack: Vec<Lanes>,
    pub(crate) included_lanes: Lanes,
    pub(crate) exit_status: ExitStatus,
    pub(crate) fatal_error: Option<ReconcilerError>,
    pub(crate) skipped_lanes: Lanes,
    pub(crate) interleaved_updated_lanes: Lanes,
    pub(crate) render_phase_updated_lanes: Lanes,
    pub(crate) pinged_lanes: Lanes,
    pub(crate) concurrent_errors: Vec<CapturedError>,
    pub(crate) recoverable_errors: Vec<CapturedError>,
    pub(crate) render_target_time: Timestamp,
    pub(crate) did_receive_update: bool,
    pub(crate) host_contexts: Vec<H::HostContext>,
    pub(crate) containers: Vec<H::Container>,
    pub(crate) contexts: ContextStack,
    pub(crate) suspense_context: SuspenseContext,
    pub(crate) suspense_stack: Vec<SuspenseContext>,
}

impl<H: HostConfig> Default for RenderSession<H> {
    fn default() -> Self {
        Self {
            root: None,
            wip: None,
            render_lanes: Lanes::NONE,
            subtree_render_lanes: Lanes::NONE,
            subtree_lanes_stack: Vec::new(),
            included_lanes: Lanes::NONE,
            exit_status: ExitStatus::InProgress,
            fatal_error: None,
            skipped_lanes: Lanes::NONE,
            interleaved_updated_lanes: Lanes::NONE,
            render_phase_updated_lanes: Lanes::NONE,
            pinged_lanes: Lanes::NONE,
            concurrent_errors: Vec::new(),
            recoverable_errors: Vec::new(),
            render_target_time: Timestamp::MAX,
            did_receive_update: false,
            host_contexts: Vec::new(),
            containers: Vec::new(),
            contexts: ContextStack::default(),
            suspense_context: SuspenseContext::empty(),
            suspense_stack: Vec::new(),
        }
    }
}

/// Just-noticeable delay before showing a fallback after `elapsed` ms.
fn jnd(elapsed: Timestamp) -> Timestamp {
    match elapsed {
        t if t < 120 => 120,
        t if t < 480 => 480,
        t if t < 1080 => 1080,
        t if t < 1920 => 1920,
        t if t < 3000 => 3000,
        t if t < 4320 => 4320,
        t => (t + 1959) / 1960 * 1960,
    }
}

impl<H: HostConfig> Reconciler<H> {
    // -- session ------------------------------------------------------------

    /// True if `lanes` must render without yielding.
    pub(crate) fn includes_blocking_lane(&self, lanes: Lanes) -> bool {
        lanes.includes_sync_lane()
            || (!self.config.concurrent_updates_by_default && lanes.includes_some(Lanes::SYNC_DEFAULT))
    }

    /// Drop the render in progress without committing it.
    pub(crate) fn reset_session(&mut self) {
        if self.session.wip.is_some() || self.session.root.is_some() {
            self.gc_pending = true;
        }
        self.session = RenderSession::default();
        self.shared.set_render_lanes(Lanes::NONE);
    }

    fn prepare_fresh_stack(&mut self, root: RootId, lanes: Lanes) -> Result<FiberId, ReconcilerError> {
        let (current, timeout) = {
            let r = self.roots.get_mut(root).ok_or(ReconcilerError::UnknownRoot)?;
            r.finished_work = None;
            r.finished_lanes = Lanes::NONE;
            (r.current, r.timeout_handle.take())
        };
        if let Some(handle) = timeout {
            self.shared.scheduler.cancel_callback(handle);
        }
        let interrupted = self.session.wip.is_some();
        if interrupted {
            tracing::debug!(
                target: "fibra.work_loop",
                lanes = %self.session.render_lanes,
                "discarding interrupted render"
            );
        }
        self.session = RenderSession::default();
        if interrupted || self.gc_pending || self.fibers.len() > self.gc_watermark {
            self.collect_garbage();
            self.gc_pending = false;
            self.gc_watermark = (self.fibers.len() * 2).max(GC_MIN_FIBERS);
        }

        let props = self.fibers[current].memoized_props.clone().unwrap_or_default();
        let wip = self.create_work_in_progress(current, props);
        let now = self.shared.now();
        let s = &mut self.session;
        s.root = Some(root);
        s.wip = Some(wip);
        s.render_lanes = lanes;
        s.subtree_render_lanes = lanes;
        s.included_lanes = lanes;
        s.render_target_time = now + self.config.suspense_list_render_timeout_ms;
        self.shared.finish_interleaved();
        self.shared.set_render_lanes(lanes);
        tracing::debug!(target: "fibra.work_loop", lanes = %lanes, "prepared fresh stack");
        Ok(wip)
    }

    fn render_root_sync(&mut self, root: RootId, lanes: Lanes) -> Result<ExitStatus, ReconcilerError> {
        let span = tracing::debug_span!("fibra.render", root = ?root, lanes = %lanes, sync = true, exit_status = tracing::field::Empty);
        let _guard = span.enter();
        let prev = self.shared.enter(ExecutionContext::RENDER);
        if self.session.root != Some(root) || self.session.render_lanes != lanes || self.session.wip.is_none() {
            if let Err(e) = self.prepare_fresh_stack(root, lanes) {
                self.shared.set_execution(prev);
                return Err(e);
            }
        }
        while let Some(unit) = self.session.wip {
            if let Err(err) = self.perform_unit_of_work(unit) {
                self.handle_error(err);
            }
        }
        self.shared.set_execution(prev);
        self.session.root = None;
        self.shared.set_render_lanes(Lanes::NONE);
        span.record("exit_status", tracing::field::debug(self.session.exit_status));
        Ok(self.session.exit_status)
    }

    fn render_root_concurrent(&mut self, root: RootId, lanes: Lanes) -> Result<ExitStatus, ReconcilerError> {
        let span = tracing::debug_span!("fibra.render", root = ?root, lanes = %lanes, sync = false, exit_status = tracing::field::Empty);
        let _guard = span.enter();
        let prev = self.shared.enter(ExecutionContext::RENDER);
        if self.session.root != Some(root) || self.session.render_lanes != lanes || self.session.wip.is_none() {
            if let Err(e) = self.prepare_fresh_stack(root, lanes) {
                self.shared.set_execution(prev);
                return Err(e);
            }
        }
        while let Some(unit) = self.session.wip {
            if self.shared.scheduler.should_yield() {
                break;
            }
            if let Err(err) = self.perform_unit_of_work(unit) {
                self.handle_error(err);
            }
        }
        self.shared.set_execution(prev);
        if self.session.wip.is_some() {
            tracing::trace!(target: "fibra.work_loop", "yielded to the host");
            span.record("exit_status", tracing::field::debug(ExitStatus::InProgress));
            return Ok(ExitStatus::InProgress);
        }
        self.session.root = None;
        self.shared.set_render_lanes(Lanes::NONE);
        span.record("exit_status", tracing::field::debug(self.session.exit_status));
        Ok(self.session.exit_status)
    }

    fn profiling(&self, fiber: FiberId) -> bool {
        self.config.profiling && self.fibers[fiber].mode.contains(Mode::PROFILE)
    }

    fn perform_unit_of_work(&mut self, unit: FiberId) -> Result<(), WorkError> {
        let current = self.fibers[unit].alternate;
        let profiling = self.profiling(unit);
        if profiling {
            self.fibers[unit].actual_start_time = self.shared.now();
        }
        let next = self.begin_work(current, unit, self.session.subtree_render_lanes)?;
        let f = &mut self.fibers[unit];
        if profiling {
            f.actual_duration += self.shared.now() - f.actual_start_time;
        }
        f.memoized_props = Some(f.pending_props.clone());
        match next {
            Some(child) => self.session.wip = Some(child),
            None => self.complete_unit_of_work(unit),
        }
        Ok(())
    }

    pub(crate) fn complete_unit_of_work(&mut self, unit: FiberId) {
        let mut completed = unit;
        loop {
            let current = self.fibers[completed].alternate;
            let parent = self.fibers[completed].return_;
            if self.fibers[completed].flags.contains(Flags::INCOMPLETE) {
                if let Some(next) = self.unwind_work(current, completed) {
                    // The boundary renders again; keep only host-visible flags.
                    self.fibers[next].flags &= Flags::HOST_EFFECT_MASK;
                    self.session.wip = Some(next);
                    return;
                }
                match parent {
                    Some(p) => {
                        let pf = &mut self.fibers[p];
                        pf.flags |= Flags::INCOMPLETE;
                        pf.subtree_flags = Flags::empty();
                        pf.deletions.clear();
                    }
                    None => {
                        self.session.exit_status = ExitStatus::DidNotComplete;
                        self.session.wip = None;
                        return;
                    }
                }
            } else if let Some(next) = self.complete_work(current, completed) {
                self.session.wip = Some(next);
                return;
            }

            if let Some(sibling) = self.fibers[completed].sibling {
                self.session.wip = Some(sibling);
                return;
            }
            match parent {
                Some(p) => completed = p,
                None => break,
            }
        }
        if self.session.exit_status == ExitStatus::InProgress {
            self.session.exit_status = ExitStatus::Completed;
        }
        self.session.wip = None;
    }

    fn handle_error(&mut self, err: WorkError) {
        let Some(errored) = self.session.wip else { return };
        self.shared.end_component_render();
        match err {
            WorkError::Fatal(error) => {
                tracing::error!(target: "fibra.work_loop", %error, "fatal error during render");
                self.session.exit_status = ExitStatus::FatalErrored;
                self.session.fatal_error = Some(error);
                self.session.wip = None;
            }
            WorkError::Throw(value) => {
                let (Some(parent), Some(root)) = (self.fibers[errored].return_, self.session.root) else {
                    self.session.exit_status = ExitStatus::FatalErrored;
                    self.session.fatal_error = Some(ReconcilerError::IncompleteRoot);
                    self.session.wip = None;
                    return;
                };
                let lanes = self.session.render_lanes;
                self.throw_exception(root, parent, errored, value, lanes);
                self.complete_unit_of_work(errored);
            }
        }
    }

    // -- stacks -------------------------------------------------------------

    pub(crate) fn push_host_container(&mut self, container: H::Container) {
        let ctx = self.host.root_host_context(&container);
        self.session.containers.push(container);
        self.session.host_contexts.push(ctx);
    }

    pub(crate) fn pop_host_container(&mut self) {
        self.session.containers.pop();
        self.session.host_contexts.pop();
    }

    pub(crate) fn push_host_context(&mut self, ty: &str) {
        if let Some(parent) = self.session.host_contexts.last() {
            let ctx = self.host.child_host_context(parent, ty);
            self.session.host_contexts.push(ctx);
        }
    }

    pub(crate) fn pop_host_context(&mut self) {
        self.session.host_contexts.pop();
    }

    pub(crate) fn push_render_lanes(&mut self, lanes: Lanes) {
        let s = &mut self.session;
        s.subtree_lanes_stack.push(s.subtree_render_lanes);
        s.subtree_render_lanes |= lanes;
        s.included_lanes |= lanes;
    }

    pub(crate) fn pop_render_lanes(&mut self) {
        let s = &mut self.session;
        s.subtree_render_lanes = s.subtree_lanes_stack.pop().unwrap_or(s.render_lanes);
    }

    // -- root entry points --------------------------------------------------

    /// Render `root` synchronously on its sync lane and commit.
    pub(crate) fn perform_sync_work_on_root(&mut self, root: RootId) -> Result<(), ReconcilerError> {
        if self.shared.is_working() {
            return Err(ReconcilerError::AlreadyWorking);
        }
        self.flush_passive_effects_impl()?;
        let Some(r) = self.roots.get(root) else {
            return Ok(());
        };
        let lanes = r.lanes.get_next_lanes(Lanes::NONE);
        if !lanes.includes_sync_lane() {
            self.ensure_root_is_scheduled(root);
            return Ok(());
        }
        let is_concurrent = r.is_concurrent();

        let mut render_lanes = lanes;
        let mut exit = self.render_root_sync(root, lanes)?;
        if is_concurrent && exit == ExitStatus::Errored {
            let retry = self.roots[root].lanes.lanes_to_retry_synchronously_on_error();
            if !retry.is_empty() {
                render_lanes = retry;
                exit = self.recover_from_concurrent_error(root, retry)?;
            }
        }
        match exit {
            ExitStatus::FatalErrored => return self.fail_render(root, render_lanes),
            ExitStatus::DidNotComplete => return Err(ReconcilerError::IncompleteRoot),
            _ => {}
        }
        self.stage_finished_work(root, render_lanes);
        self.commit_root(root)?;
        self.ensure_root_is_scheduled(root);
        Ok(())
    }

    /// One slice of concurrent work on `root`.
    pub(crate) fn perform_concurrent_work_on_root(&mut self, root: RootId) -> Result<(), ReconcilerError> {
        if self.shared.is_working() {
            return Err(ReconcilerError::AlreadyWorking);
        }
        let original = self.roots.get(root).ok_or(ReconcilerError::UnknownRoot)?.callback_node;
        let did_flush = self.flush_passive_effects_impl()?;
        if did_flush && self.roots.get(root).map(|r| r.callback_node) != Some(original) {
            // The flush scheduled different work for this root.
            return Ok(());
        }

        let wip_lanes = if self.session.root == Some(root) {
            self.session.render_lanes
        } else {
            Lanes::NONE
        };
        let Some(r) = self.roots.get(root) else {
            return Ok(());
        };
        let lanes = r.lanes.get_next_lanes(wip_lanes);
        if lanes.is_empty() {
            return Ok(());
        }
        let time_slice = !self.includes_blocking_lane(lanes) && !r.lanes.includes_expired_lane(lanes);

        let mut render_lanes = lanes;
        let mut exit = if time_slice {
            self.render_root_concurrent(root, lanes)?
        } else {
            self.render_root_sync(root, lanes)?
        };

        if exit != ExitStatus::InProgress {
            if exit == ExitStatus::Errored {
                let retry = self.roots[root].lanes.lanes_to_retry_synchronously_on_error();
                if !retry.is_empty() {
                    render_lanes = retry;
                    exit = self.recover_from_concurrent_error(root, retry)?;
                }
            }
            if exit == ExitStatus::FatalErrored {
                return self.fail_render(root, render_lanes);
            }
            if exit == ExitStatus::DidNotComplete {
                self.mark_root_suspended(root, render_lanes);
            } else {
                let finished = self.roots[root].current;
                let finished = self.fibers[finished].alternate.unwrap_or(finished);
                if time_slice && !self.is_consistent_with_external_stores(finished) {
                    tracing::debug!(target: "fibra.work_loop", "store changed during render; re-rendering synchronously");
                    exit = self.render_root_sync(root, render_lanes)?;
                    if exit == ExitStatus::Errored {
                        let retry = self.roots[root].lanes.lanes_to_retry_synchronously_on_error();
                        if !retry.is_empty() {
                            render_lanes = retry;
                            exit = self.recover_from_concurrent_error(root, retry)?;
                        }
                    }
                    if exit == ExitStatus::FatalErrored {
                        return self.fail_render(root, render_lanes);
                    }
                }
                self.stage_finished_work(root, render_lanes);
                self.finish_concurrent_render(root, exit, render_lanes)?;
            }
        }
        self.ensure_root_is_scheduled(root);
        Ok(())
    }

    fn stage_finished_work(&mut self, root: RootId, lanes: Lanes) {
        let errors = std::mem::take(&mut self.session.recoverable_errors);
        if let Some(r) = self.roots.get_mut(root) {
            let finished = self.fibers[r.current].alternate.unwrap_or(r.current);
            r.finished_work = Some(finished);
            r.finished_lanes = lanes;
            r.recoverable_errors = errors;
        }
    }

    fn recover_from_concurrent_error(&mut self, root: RootId, lanes: Lanes) -> Result<ExitStatus, ReconcilerError> {
        let first_attempt = std::mem::take(&mut self.session.concurrent_errors);
        tracing::debug!(
            target: "fibra.work_loop",
            lanes = %lanes,
            errors = first_attempt.len(),
            "retrying errored render synchronously"
        );
        let exit = self.render_root_sync(root, lanes)?;
        if exit != ExitStatus::Errored {
            let second_attempt = std::mem::take(&mut self.session.recoverable_errors);
            self.session.recoverable_errors = first_attempt;
            self.session.recoverable_errors.extend(second_attempt);
        }
        Ok(exit)
    }

    fn fail_render(&mut self, root: RootId, lanes: Lanes) -> Result<(), ReconcilerError> {
        let error = self
            .session
            .fatal_error
            .take()
            .unwrap_or(ReconcilerError::IncompleteRoot);
        self.reset_session();
        self.mark_root_suspended(root, lanes);
        self.ensure_root_is_scheduled(root);
        Err(error)
    }

    pub(crate) fn mark_root_suspended(&mut self, root: RootId, lanes: Lanes) {
        let suspended = lanes
            .remove(self.session.pinged_lanes)
            .remove(self.session.interleaved_updated_lanes);
        if let Some(r) = self.roots.get_mut(root) {
            r.lanes.mark_root_suspended(suspended);
        }
    }

    fn finish_concurrent_render(&mut self, root: RootId, exit: ExitStatus, lanes: Lanes) -> Result<(), ReconcilerError> {
        match exit {
            ExitStatus::InProgress | ExitStatus::FatalErrored | ExitStatus::DidNotComplete => {
                Err(ReconcilerError::IncompleteRoot)
            }
            ExitStatus::Errored | ExitStatus::Completed => self.commit_root(root),
            ExitStatus::Suspended => {
                self.mark_root_suspended(root, lanes);
                if lanes.includes_only_retries() {
                    let now = self.shared.now();
                    let wait = self.most_recent_fallback_time + self.config.fallback_throttle_ms - now;
                    if wait > self.config.min_suspense_timeout_ms {
                        let r = &mut self.roots[root];
                        if !r.lanes.get_next_lanes(Lanes::NONE).is_empty() {
                            // Other work is ready; it will pick this up.
                            return Ok(());
                        }
                        if !r.lanes.suspended.contains(lanes) {
                            let suspended = r.lanes.suspended;
                            r.lanes.mark_root_pinged(suspended);
                            return Ok(());
                        }
                        self.schedule_suspended_commit(root, wait);
                        return Ok(());
                    }
                }
                self.commit_root(root)
            }
            ExitStatus::SuspendedWithDelay => {
                self.mark_root_suspended(root, lanes);
                if lanes.includes_only_transitions() {
                    // Keep showing the previous screen until pinged.
                    tracing::debug!(target: "fibra.work_loop", lanes = %lanes, "transition suspended; not committing");
                    return Ok(());
                }
                let now = self.shared.now();
                let event_time = self.roots[root].lanes.most_recent_event_time(lanes);
                let elapsed = now - event_time;
                let wait = jnd(elapsed) - elapsed;
                if wait > self.config.min_suspense_timeout_ms {
                    self.schedule_suspended_commit(root, wait);
                    return Ok(());
                }
                self.commit_root(root)
            }
        }
    }

    fn schedule_suspended_commit(&mut self, root: RootId, wait: Timestamp) {
        let handle = self.shared.scheduler.schedule_callback(
            SchedulerPriority::Normal,
            Task::CommitSuspended(root),
            Some(wait),
        );
        tracing::debug!(target: "fibra.work_loop", wait_ms = wait, handle = %handle, "delaying suspended commit");
        self.roots[root].timeout_handle = Some(handle);
    }

    /// Re-read every store snapshot a sliced render used.
    fn is_consistent_with_external_stores(&self, finished: FiberId) -> bool {
        let mut stack = vec![finished];
        while let Some(id) = stack.pop() {
            let f = &self.fibers[id];
            if f.flags.contains(Flags::STORE_CONSISTENCY)
                && let FiberQueue::Function(queue) = &f.update_queue
                && !queue.stores.iter().all(|s| s.is_consistent())
            {
                return false;
            }
            if f.subtree_flags.contains(Flags::STORE_CONSISTENCY) {
                let mut child = f.child;
                while let Some(c) = child {
                    stack.push(c);
                    child = self.fibers[c].sibling;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jnd_rounds_up_to_buckets() {
        assert_eq!(jnd(0), 120);
        assert_eq!(jnd(119), 120);
        assert_eq!(jnd(120), 480);
        assert_eq!(jnd(2000), 3000);
        assert_eq!(jnd(5000), 5880);
    }
}
