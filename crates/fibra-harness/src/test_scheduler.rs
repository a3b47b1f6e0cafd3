#![forbid(unsafe_code)]

//! Deterministic scheduler with a virtual clock.
//!
//! Tasks are ordered the way a cooperative browser-style scheduler orders
//! them: by expiration time (`start + priority timeout`), then by insertion.
//! Delayed tasks become ready only once the clock reaches their start time.
//!
//! Time only moves when a test calls [`TestScheduler::advance`] or when a
//! unit of work is configured to cost time with
//! [`TestScheduler::set_work_cost`].
//!
//! # Yielding
//!
//! | Setting | `should_yield` |
//! |---------|----------------|
//! | `set_slice(None)` (default) | always `false` |
//! | `set_slice(Some(n))` | `true` after `n` checks in the current slice |
//!
//! The harness opens a new slice before every task it runs.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use fibra_core::{CallbackHandle, Scheduler, SchedulerPriority, Task, Timestamp};

/// A task waiting in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub handle: CallbackHandle,
    pub priority: SchedulerPriority,
    pub task: Task,
    pub start: Timestamp,
    pub expiration: Timestamp,
}

/// Virtual-clock [`Scheduler`] for tests.
#[derive(Debug, Default)]
pub struct TestScheduler {
    now: Cell<Timestamp>,
    next_handle: Cell<u64>,
    // Keyed by (expiration, handle) so iteration is run order.
    queue: RefCell<BTreeMap<(Timestamp, u64), QueuedTask>>,
    slice: Cell<Option<u32>>,
    slice_used: Cell<u32>,
    work_cost: Cell<Timestamp>,
    paints: Cell<u32>,
    scheduled_total: Cell<u64>,
    cancelled_total: Cell<u64>,
}

impl TestScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- clock --------------------------------------------------------------

    /// Move the clock forward by `ms`.
    pub fn advance(&self, ms: Timestamp) {
        self.now.set(self.now.get() + ms.max(0));
    }

    /// Milliseconds every `should_yield` check adds to the clock.
    pub fn set_work_cost(&self, ms: Timestamp) {
        self.work_cost.set(ms.max(0));
    }

    // -- slicing ------------------------------------------------------------

    /// Limit each slice to `units` yield checks; `None` never yields.
    pub fn set_slice(&self, units: Option<u32>) {
        self.slice.set(units);
    }

    /// Start a fresh time slice.
    pub fn begin_slice(&self) {
        self.slice_used.set(0);
    }

    // -- queue --------------------------------------------------------------

    /// Remove and return the next task that is ready to run.
    pub fn pop_ready(&self) -> Option<QueuedTask> {
        let now = self.now.get();
        let mut queue = self.queue.borrow_mut();
        let key = queue
            .iter()
            .find(|(_, t)| t.start <= now)
            .map(|(k, _)| *k)?;
        queue.remove(&key)
    }

    /// Put a yielded task back under its original handle.
    pub fn requeue(&self, task: QueuedTask) {
        self.queue
            .borrow_mut()
            .insert((task.expiration, task.handle.raw()), task);
    }

    /// Earliest start time among delayed tasks that are not ready yet.
    #[must_use]
    pub fn next_delayed_start(&self) -> Option<Timestamp> {
        let now = self.now.get();
        self.queue
            .borrow()
            .values()
            .filter(|t| t.start > now)
            .map(|t| t.start)
            .min()
    }

    /// Snapshot of the queue in run order.
    #[must_use]
    pub fn queued(&self) -> Vec<QueuedTask> {
        self.queue.borrow().values().copied().collect()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    // -- counters -----------------------------------------------------------

    #[must_use]
    pub fn paint_requests(&self) -> u32 {
        self.paints.get()
    }

    #[must_use]
    pub fn scheduled_total(&self) -> u64 {
        self.scheduled_total.get()
    }

    #[must_use]
    pub fn cancelled_total(&self) -> u64 {
        self.cancelled_total.get()
    }
}

impl Scheduler for TestScheduler {
    fn schedule_callback(
        &self,
        priority: SchedulerPriority,
        task: Task,
        delay_ms: Option<Timestamp>,
    ) -> CallbackHandle {
        let raw = self.next_handle.get() + 1;
        self.next_handle.set(raw);
        self.scheduled_total.set(self.scheduled_total.get() + 1);
        let handle = CallbackHandle::from_raw(raw);
        let start = self.now.get() + delay_ms.unwrap_or(0).max(0);
        let expiration = start.saturating_add(priority.timeout_ms());
        self.queue.borrow_mut().insert(
            (expiration, raw),
            QueuedTask {
                handle,
                priority,
                task,
                start,
                expiration,
            },
        );
        tracing::trace!(target: "fibra.harness", %handle, task = task.name(), ?priority, start, "task scheduled");
        handle
    }

    fn cancel_callback(&self, handle: CallbackHandle) {
        let mut queue = self.queue.borrow_mut();
        let before = queue.len();
        queue.retain(|_, t| t.handle != handle);
        if queue.len() != before {
            self.cancelled_total.set(self.cancelled_total.get() + 1);
        }
    }

    fn should_yield(&self) -> bool {
        self.now.set(self.now.get() + self.work_cost.get());
        let used = self.slice_used.get() + 1;
        self.slice_used.set(used);
        self.slice.get().is_some_and(|limit| used > limit)
    }

    fn request_paint(&self) {
        self.paints.set(self.paints.get() + 1);
    }

    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibra_core::RootId;

    #[test]
    fn immediate_runs_before_normal() {
        let s = TestScheduler::new();
        s.schedule_callback(SchedulerPriority::Normal, Task::PerformWork(RootId::default()), None);
        s.schedule_callback(SchedulerPriority::Immediate, Task::FlushSyncQueue, None);
        assert_eq!(s.pop_ready().map(|t| t.task), Some(Task::FlushSyncQueue));
        assert!(matches!(s.pop_ready().map(|t| t.task), Some(Task::PerformWork(_))));
        assert!(s.pop_ready().is_none());
    }

    #[test]
    fn delayed_tasks_wait_for_the_clock() {
        let s = TestScheduler::new();
        s.schedule_callback(SchedulerPriority::Normal, Task::FlushPassiveEffects, Some(100));
        assert!(s.pop_ready().is_none());
        assert_eq!(s.next_delayed_start(), Some(100));
        s.advance(100);
        assert!(s.pop_ready().is_some());
    }

    #[test]
    fn cancel_removes_and_counts() {
        let s = TestScheduler::new();
        let h = s.schedule_callback(SchedulerPriority::Normal, Task::ProcessUpdates, None);
        s.cancel_callback(h);
        s.cancel_callback(h);
        assert!(s.is_idle());
        assert_eq!(s.cancelled_total(), 1);
    }

    #[test]
    fn slice_limits_yield_checks() {
        let s = TestScheduler::new();
        assert!(!s.should_yield());
        s.set_slice(Some(2));
        s.begin_slice();
        assert!(!s.should_yield());
        assert!(!s.should_yield());
        assert!(s.should_yield());
        s.begin_slice();
        assert!(!s.should_yield());
    }

    #[test]
    fn work_cost_moves_the_clock() {
        let s = TestScheduler::new();
        s.set_work_cost(3);
        let _ = s.should_yield();
        let _ = s.should_yield();
        assert_eq!(s.now(), 6);
    }
}
