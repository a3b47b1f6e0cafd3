#![forbid(unsafe_code)]

//! Thenable protocol for suspending components.
//!
//! A component that cannot finish rendering yet returns
//! `Throw::Suspend(wakeable)`. The reconciler registers listeners with
//! [`Wakeable::then`]; settling the wakeable calls each listener exactly
//! once.
//!
//! # Invariants
//!
//! - A wakeable settles at most once; later `resolve`/`reject` calls are
//!   ignored.
//! - Listeners registered after settling run immediately.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_WAKEABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Settlement state of a [`Wakeable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeableStatus {
    Pending,
    Resolved,
    Rejected,
}

type Listener = Box<dyn FnOnce()>;

struct Inner {
    id: u64,
    status: Cell<WakeableStatus>,
    listeners: RefCell<Vec<Listener>>,
}

/// Shared handle to a pending value.
#[derive(Clone)]
pub struct Wakeable {
    inner: Rc<Inner>,
}

impl Wakeable {
    /// A new pending wakeable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                id: NEXT_WAKEABLE_ID.fetch_add(1, Ordering::Relaxed),
                status: Cell::new(WakeableStatus::Pending),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn status(&self) -> WakeableStatus {
        self.inner.status.get()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status() == WakeableStatus::Pending
    }

    /// Register a listener called once the wakeable settles.
    pub fn then(&self, listener: impl FnOnce() + 'static) {
        if self.is_pending() {
            self.inner.listeners.borrow_mut().push(Box::new(listener));
        } else {
            listener();
        }
    }

    pub fn resolve(&self) {
        self.settle(WakeableStatus::Resolved);
    }

    pub fn reject(&self) {
        self.settle(WakeableStatus::Rejected);
    }

    fn settle(&self, status: WakeableStatus) {
        if !self.is_pending() {
            return;
        }
        self.inner.status.set(status);
        let listeners = std::mem::take(&mut *self.inner.listeners.borrow_mut());
        tracing::trace!(
            target: "fibra.throw",
            wakeable = self.inner.id,
            listeners = listeners.len(),
            ?status,
            "wakeable settled"
        );
        for listener in listeners {
            listener();
        }
    }
}

impl Default for Wakeable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Wakeable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Wakeable {}

impl fmt::Debug for Wakeable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wakeable")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_run_once_on_resolve() {
        let w = Wakeable::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        w.then(move || h.set(h.get() + 1));
        w.resolve();
        w.resolve();
        w.reject();
        assert_eq!(hits.get(), 1);
        assert_eq!(w.status(), WakeableStatus::Resolved);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let w = Wakeable::new();
        w.reject();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        w.then(move || h.set(true));
        assert!(hit.get());
    }

    #[test]
    fn listener_may_register_another_listener() {
        let w = Wakeable::new();
        let hits = Rc::new(Cell::new(0));
        let (w2, h) = (w.clone(), hits.clone());
        w.then(move || {
            let h2 = h.clone();
            h.set(h.get() + 1);
            w2.then(move || h2.set(h2.get() + 1));
        });
        w.resolve();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn identity_is_by_handle() {
        let a = Wakeable::new();
        let b = Wakeable::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
