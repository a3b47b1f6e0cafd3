#![forbid(unsafe_code)]

//! Thrown values: suspension and component errors.
//!
//! A component either suspends on a [`Wakeable`] or fails with a
//! [`ComponentError`]. Both travel up the return path from the fiber that
//! threw. Suspension is captured by the nearest suspense boundary that is
//! not already showing its fallback; errors are captured by the nearest
//! class error boundary, or by the root when no boundary accepts them.
//!
//! Panics inside user code are caught at the call site and turned into
//! errors, except [`InvariantViolation`] payloads, which abort the render.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use fibra_core::{
    ComponentError, FiberId, Flags, HostConfig, InvariantViolation, Lanes, ReconcilerError, RootId,
    Throw, Wakeable,
};

use crate::component::{ClassState, ErrorInfo};
use crate::fiber::{FiberKind, FiberQueue, MemoState, StateNode};
use crate::reconciler::Reconciler;
use crate::update_queue::{CapturedError, Payload, RootState, Update, UpdateCallback, UpdateTag};
use crate::work_loop::ExitStatus;

/// Why a unit of work stopped.
#[derive(Debug)]
pub(crate) enum WorkError {
    /// Routed to a boundary.
    Throw(Throw),
    /// Aborts the whole render.
    Fatal(ReconcilerError),
}

impl From<Throw> for WorkError {
    fn from(value: Throw) -> Self {
        Self::Throw(value)
    }
}

impl From<ReconcilerError> for WorkError {
    fn from(value: ReconcilerError) -> Self {
        Self::Fatal(value)
    }
}

fn from_panic(payload: Box<dyn Any + Send>) -> WorkError {
    match payload.downcast::<InvariantViolation>() {
        Ok(violation) => WorkError::Fatal(violation.0),
        Err(other) => WorkError::Throw(Throw::Error(ComponentError::from_panic(other.as_ref()))),
    }
}

/// Run render-phase user code, converting panics into thrown errors.
pub(crate) fn call_user<T>(f: impl FnOnce() -> Result<T, Throw>) -> Result<T, WorkError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(thrown)) => Err(WorkError::Throw(thrown)),
        Err(payload) => Err(from_panic(payload)),
    }
}

/// Run commit-phase user code, converting panics into errors.
pub(crate) fn call_user_commit<T>(f: impl FnOnce() -> Result<T, ComponentError>) -> Result<T, ComponentError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ComponentError::from_panic(payload.as_ref())),
    }
}

impl<H: HostConfig> Reconciler<H> {
    /// Route a value thrown by `source` to the boundary that handles it.
    pub(crate) fn throw_exception(
        &mut self,
        root: RootId,
        return_fiber: FiberId,
        source: FiberId,
        value: Throw,
        render_lanes: Lanes,
    ) {
        self.fibers[source].flags |= Flags::INCOMPLETE;
        let error = match value {
            Throw::Suspend(wakeable) => {
                if let Some(boundary) = self.nearest_suspense_boundary(return_fiber) {
                    tracing::debug!(
                        target: "fibra.throw",
                        component = %self.fibers[source].kind.name(),
                        wakeable = wakeable.id(),
                        "suspended; captured by boundary"
                    );
                    let b = &mut self.fibers[boundary];
                    b.flags |= Flags::SHOULD_CAPTURE;
                    b.lanes = render_lanes;
                    if b.is_concurrent() {
                        self.attach_ping_listener(root, &wakeable, render_lanes);
                    }
                    Self::attach_retry_wakeable(&mut self.fibers[boundary].update_queue, wakeable);
                    return;
                }
                if !render_lanes.includes_sync_lane() {
                    tracing::debug!(target: "fibra.throw", wakeable = wakeable.id(), "suspended without a boundary");
                    self.attach_ping_listener(root, &wakeable, render_lanes);
                    self.render_did_suspend_delay_if_possible();
                    return;
                }
                ComponentError::new(format!(
                    "`{}` suspended while responding to synchronous input; wrap it in a suspense boundary",
                    self.fibers[source].kind.name()
                ))
            }
            Throw::Error(error) => error,
        };

        let captured = CapturedError {
            error,
            info: ErrorInfo {
                component_stack: self.component_stack(source),
            },
        };
        tracing::debug!(
            target: "fibra.throw",
            component = %self.fibers[source].kind.name(),
            error = %captured.error,
            "component threw"
        );
        self.render_did_error(captured.clone());
        let lane = render_lanes.highest_priority_lane();
        let now = self.shared.now();

        let mut node = Some(return_fiber);
        while let Some(id) = node {
            match &self.fibers[id].kind {
                FiberKind::HostRoot => {
                    let f = &mut self.fibers[id];
                    f.flags |= Flags::SHOULD_CAPTURE;
                    f.lanes |= lane;
                    let update = Update::<RootState>::new(lane, now, Payload::Partial(None))
                        .tagged(UpdateTag::CaptureUpdate)
                        .with_callback(Some(UpdateCallback::Uncaught(captured)));
                    self.enqueue_captured_update(id, update);
                    return;
                }
                FiberKind::Class(_) if !self.fibers[id].flags.contains(Flags::DID_CAPTURE) => {
                    if let Some(update) = self.create_class_error_update(id, &captured, lane, now) {
                        let f = &mut self.fibers[id];
                        f.flags |= Flags::SHOULD_CAPTURE;
                        f.lanes |= lane;
                        self.enqueue_captured_update(id, update);
                        return;
                    }
                }
                _ => {}
            }
            node = self.fibers[id].return_;
        }
    }

    /// Capture update for a class boundary, or `None` if it cannot catch.
    fn create_class_error_update(
        &self,
        fiber: FiberId,
        captured: &CapturedError,
        lane: Lanes,
        now: fibra_core::Timestamp,
    ) -> Option<Update<ClassState>> {
        let StateNode::Class(inst) = &self.fibers[fiber].state_node else {
            return None;
        };
        let inst = inst.clone();
        if !inst.borrow().component.is_error_boundary() {
            return None;
        }
        let derived = call_user_commit(|| Ok(inst.borrow().component.get_derived_state_from_error(&captured.error)))
            .ok()
            .flatten();
        let without_derived_state = derived.is_none();
        {
            let mut i = inst.borrow_mut();
            if without_derived_state && i.failed {
                return None;
            }
            i.capture_renders_nothing = without_derived_state;
        }
        let payload = derived.map_or(Payload::None, Payload::Partial);
        Some(
            Update::new(lane, now, payload)
                .tagged(UpdateTag::CaptureUpdate)
                .with_callback(Some(UpdateCallback::DidCatch {
                    error: captured.clone(),
                    without_derived_state,
                })),
        )
    }

    fn nearest_suspense_boundary(&self, from: FiberId) -> Option<FiberId> {
        let mut node = Some(from);
        while let Some(id) = node {
            let f = &self.fibers[id];
            if matches!(f.kind, FiberKind::Suspense) && !matches!(f.memoized_state, MemoState::SuspenseFallback) {
                return Some(id);
            }
            node = f.return_;
        }
        None
    }

    fn attach_retry_wakeable(queue: &mut FiberQueue, wakeable: Wakeable) {
        match queue {
            FiberQueue::Retry(list) => {
                if !list.iter().any(|w| w.id() == wakeable.id()) {
                    list.push(wakeable);
                }
            }
            other => *other = FiberQueue::Retry(vec![wakeable]),
        }
    }

    /// Route an error thrown during commit to the nearest boundary.
    ///
    /// `nearest` is the closest mounted ancestor; deleted fibers pass it
    /// explicitly because their return path may already be detached.
    pub(crate) fn capture_commit_phase_error(&mut self, source: FiberId, nearest: Option<FiberId>, error: ComponentError) {
        let captured = CapturedError {
            info: ErrorInfo {
                component_stack: self.component_stack(source),
            },
            error,
        };
        tracing::debug!(target: "fibra.throw", error = %captured.error, "error during commit");
        let now = self.shared.now();
        let mut node = if matches!(self.fibers.get(source).map(|f| &f.kind), Some(FiberKind::HostRoot)) {
            Some(source)
        } else {
            nearest
        };
        while let Some(id) = node {
            let Some(f) = self.fibers.get(id) else { break };
            let parent = f.return_;
            match &f.kind {
                FiberKind::HostRoot => {
                    let update = Update::<RootState>::new(Lanes::SYNC, now, Payload::Partial(None))
                        .tagged(UpdateTag::CaptureUpdate)
                        .with_callback(Some(UpdateCallback::Uncaught(captured)));
                    self.enqueue_update(id, update);
                    self.schedule_sync_capture(id, now);
                    return;
                }
                FiberKind::Class(_) => {
                    if let Some(update) = self.create_class_error_update(id, &captured, Lanes::SYNC, now) {
                        self.enqueue_update(id, update);
                        self.schedule_sync_capture(id, now);
                        return;
                    }
                }
                _ => {}
            }
            node = parent;
        }
        // Nothing above could take it; report it as uncaught.
        self.report_uncaught_error(&captured);
    }

    fn schedule_sync_capture(&mut self, fiber: FiberId, now: fibra_core::Timestamp) {
        if let Some(root) = self.mark_update_lane_from_fiber_to_root(fiber, Lanes::SYNC) {
            self.roots[root].lanes.mark_root_updated(Lanes::SYNC, now);
            self.ensure_root_is_scheduled(root);
        }
    }

    // -- exit status --------------------------------------------------------

    pub(crate) fn render_did_suspend(&mut self) {
        if self.session.exit_status == ExitStatus::InProgress {
            self.session.exit_status = ExitStatus::Suspended;
        }
    }

    pub(crate) fn render_did_suspend_delay_if_possible(&mut self) {
        let s = &mut self.session;
        if matches!(
            s.exit_status,
            ExitStatus::InProgress | ExitStatus::Suspended | ExitStatus::Errored
        ) {
            s.exit_status = ExitStatus::SuspendedWithDelay;
        }
        // Lower-priority work this render skipped may unblock the suspension;
        // suspend now so the next render picks it up.
        if let Some(root) = s.root
            && (s.skipped_lanes.includes_non_idle_work() || s.interleaved_updated_lanes.includes_non_idle_work())
        {
            let lanes = s.render_lanes;
            self.mark_root_suspended(root, lanes);
        }
    }

    pub(crate) fn render_did_error(&mut self, error: CapturedError) {
        let s = &mut self.session;
        if s.exit_status != ExitStatus::SuspendedWithDelay {
            s.exit_status = ExitStatus::Errored;
        }
        s.concurrent_errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panics_become_component_errors() {
        let out: Result<(), WorkError> = call_user(|| panic!("boom"));
        match out {
            Err(WorkError::Throw(Throw::Error(e))) => assert_eq!(e.message(), "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invariant_panics_stay_fatal() {
        let out: Result<(), WorkError> = call_user(|| {
            std::panic::panic_any(InvariantViolation(ReconcilerError::TooManyHooks {
                component: "App".into(),
            }))
        });
        assert!(matches!(
            out,
            Err(WorkError::Fatal(ReconcilerError::TooManyHooks { .. }))
        ));
    }

    #[test]
    fn commit_guard_passes_results_through() {
        assert_eq!(call_user_commit(|| Ok(3)).ok(), Some(3));
        assert!(call_user_commit::<()>(|| Err(ComponentError::new("x"))).is_err());
    }
}
