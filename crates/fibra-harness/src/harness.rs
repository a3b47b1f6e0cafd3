#![forbid(unsafe_code)]

//! A reconciler wired to [`TestHost`] and [`TestScheduler`].
//!
//! [`Harness`] owns one root and drives the scheduler by hand: nothing runs
//! until a test calls [`Harness::flush_work`] (ready tasks only) or
//! [`Harness::flush_all`] (also advances the clock through delayed tasks).
//! Yielded tasks go back on the queue under their original handle, the way
//! a cooperative scheduler continues a callback.

use std::cell::RefCell;
use std::rc::Rc;

use fibra_core::{
    ComponentError, Lane, Lanes, ReconcilerConfig, ReconcilerError, RootId, Scheduler, Task, TaskStatus,
    Timestamp,
};
use fibra_reconciler::{Element, ErrorInfo, Reconciler, ReconcilerObserver, RootTag};

use crate::test_host::{ContainerId, TestHost};
use crate::test_scheduler::TestScheduler;

/// Stop a flush after this many tasks; a well-behaved tree never gets close.
const MAX_TASKS_PER_FLUSH: usize = 100_000;

/// Shared, append-only string log for recording what components did.
#[derive(Debug, Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    /// Return and clear everything logged so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// Observer that writes every notification to a [`Log`].
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    log: Log,
    suppress_uncaught: bool,
}

impl RecordingObserver {
    #[must_use]
    pub fn new(log: Log) -> Self {
        Self {
            log,
            suppress_uncaught: false,
        }
    }

    /// Swallow uncaught errors instead of letting them reach `tracing`.
    #[must_use]
    pub fn suppressing_uncaught(mut self) -> Self {
        self.suppress_uncaught = true;
        self
    }
}

impl ReconcilerObserver for RecordingObserver {
    fn on_commit(&self, _root: RootId, lanes: Lanes) {
        self.log.push(format!("commit {lanes}"));
    }

    fn on_caught_error(&self, error: &ComponentError, _info: &ErrorInfo, boundary: &str) {
        self.log.push(format!("caught by {boundary}: {}", error.message()));
    }

    fn on_uncaught_error(&self, error: &ComponentError, _info: &ErrorInfo) -> bool {
        self.log.push(format!("uncaught: {}", error.message()));
        !self.suppress_uncaught
    }

    fn on_recoverable_error(&self, error: &ComponentError, _info: &ErrorInfo) {
        self.log.push(format!("recoverable: {}", error.message()));
    }

    fn on_unmount(&self, _root: RootId) {
        self.log.push("unmount");
    }
}

/// One root rendered into a [`TestHost`] container.
pub struct Harness {
    pub reconciler: Reconciler<TestHost>,
    scheduler: Rc<TestScheduler>,
    container: ContainerId,
    root: RootId,
}

impl Harness {
    /// A legacy (always synchronous) root.
    #[must_use]
    pub fn legacy() -> Self {
        Self::with_config(RootTag::Legacy, ReconcilerConfig::default())
    }

    /// A concurrent root.
    #[must_use]
    pub fn concurrent() -> Self {
        Self::with_config(RootTag::Concurrent, ReconcilerConfig::default())
    }

    #[must_use]
    pub fn with_config(tag: RootTag, config: ReconcilerConfig) -> Self {
        let scheduler = Rc::new(TestScheduler::new());
        let mut host = TestHost::new();
        let container = host.create_container();
        let mut reconciler = Reconciler::new(host, scheduler.clone(), config);
        let root = reconciler.create_container(container, tag);
        Self {
            reconciler,
            scheduler,
            container,
            root,
        }
    }

    /// Install `observer` on the reconciler.
    #[must_use]
    pub fn with_observer(self, observer: impl ReconcilerObserver + 'static) -> Self {
        Self {
            reconciler: self.reconciler.with_observer(observer),
            ..self
        }
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn root(&self) -> RootId {
        self.root
    }

    #[must_use]
    pub fn container(&self) -> ContainerId {
        self.container
    }

    #[must_use]
    pub fn scheduler(&self) -> &TestScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn host(&self) -> &TestHost {
        self.reconciler.host()
    }

    pub fn host_mut(&mut self) -> &mut TestHost {
        self.reconciler.host_mut()
    }

    /// Markup of the root container.
    #[must_use]
    pub fn markup(&self) -> String {
        self.host().markup(self.container)
    }

    /// Visible text of the root container.
    #[must_use]
    pub fn text(&self) -> String {
        self.host().text_content(self.container)
    }

    /// Pending lanes of the root; empty once the root was unmounted.
    #[must_use]
    pub fn pending_lanes(&self) -> Lanes {
        self.reconciler.pending_lanes(self.root).unwrap_or(Lanes::NONE)
    }

    // -- driving ------------------------------------------------------------

    /// Schedule `element` without running any task.
    pub fn update(&mut self, element: Element) -> Result<Lane, ReconcilerError> {
        self.reconciler.update_container(self.root, element)
    }

    /// Schedule `element` and run all ready work.
    pub fn render(&mut self, element: Element) -> Result<Lane, ReconcilerError> {
        let lane = self.update(element)?;
        self.flush_work()?;
        Ok(lane)
    }

    /// Run `f` (typically dispatching through setters or host callbacks),
    /// then apply its updates and run all ready work.
    pub fn act<R>(&mut self, f: impl FnOnce() -> R) -> Result<R, ReconcilerError> {
        let out = f();
        self.reconciler.process_updates()?;
        self.flush_work()?;
        Ok(out)
    }

    /// Run the next ready task; `None` if nothing is ready.
    pub fn run_next(&mut self) -> Result<Option<(Task, TaskStatus)>, ReconcilerError> {
        let Some(queued) = self.scheduler.pop_ready() else {
            return Ok(None);
        };
        self.scheduler.begin_slice();
        let status = self.reconciler.run_task(queued.task)?;
        tracing::trace!(target: "fibra.harness", handle = %queued.handle, task = queued.task.name(), ?status, "task ran");
        if status == TaskStatus::Continue {
            self.scheduler.requeue(queued);
        }
        Ok(Some((queued.task, status)))
    }

    /// Run ready tasks until none is left; returns how many ran.
    pub fn flush_work(&mut self) -> Result<usize, ReconcilerError> {
        let mut ran = 0;
        while ran < MAX_TASKS_PER_FLUSH && self.run_next()?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Run up to `n` ready tasks.
    pub fn flush_tasks(&mut self, n: usize) -> Result<usize, ReconcilerError> {
        let mut ran = 0;
        while ran < n && self.run_next()?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Run everything, advancing the clock to each delayed task in turn.
    pub fn flush_all(&mut self) -> Result<usize, ReconcilerError> {
        let mut ran = self.flush_work()?;
        while let Some(start) = self.scheduler.next_delayed_start() {
            self.scheduler.advance(start - self.scheduler.now());
            ran += self.flush_work()?;
            if ran >= MAX_TASKS_PER_FLUSH {
                break;
            }
        }
        Ok(ran)
    }

    /// Move the clock forward and run whatever became ready.
    pub fn advance(&mut self, ms: Timestamp) -> Result<usize, ReconcilerError> {
        self.scheduler.advance(ms);
        self.flush_work()
    }

    /// Unmount the root and run any follow-up work.
    pub fn unmount(&mut self) -> Result<(), ReconcilerError> {
        self.reconciler.unmount(self.root)?;
        self.flush_work()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_take_clears() {
        let log = Log::new();
        log.push("a");
        log.clone().push("b");
        assert_eq!(log.take(), vec!["a", "b"]);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn legacy_render_commits_immediately() {
        let mut h = Harness::legacy();
        let container = h.container();
        h.reconciler
            .render(Element::host("div").attr("id", "x"), container)
            .expect("render");
        assert_eq!(h.markup(), r#"<div id="x"/>"#);
        assert!(h.host().violations().is_empty());
    }

    #[test]
    fn concurrent_render_waits_for_the_scheduler() {
        let mut h = Harness::concurrent();
        h.update(Element::text("hi")).expect("update");
        assert_eq!(h.text(), "");
        h.flush_work().expect("flush");
        assert_eq!(h.text(), "hi");
        assert!(h.scheduler().is_idle() || h.pending_lanes().is_empty());
    }
}
