#![forbid(unsafe_code)]

//! Observation hooks for embedders and tooling.
//!
//! Nothing an observer returns changes what the reconciler renders; the one
//! exception is [`ReconcilerObserver::on_uncaught_error`], whose return
//! value decides whether the default `error` event is still emitted.

use fibra_core::{ComponentError, Lanes, RootId};

use crate::component::ErrorInfo;

/// Receives commit, unmount and error notifications.
pub trait ReconcilerObserver {
    /// A root committed `lanes`.
    fn on_commit(&self, _root: RootId, _lanes: Lanes) {}

    /// The boundary named `boundary` caught `error`.
    fn on_caught_error(&self, _error: &ComponentError, _info: &ErrorInfo, _boundary: &str) {}

    /// No boundary caught `error` and the root now renders nothing.
    ///
    /// Return `false` to suppress the default `tracing::error!` report.
    fn on_uncaught_error(&self, _error: &ComponentError, _info: &ErrorInfo) -> bool {
        true
    }

    /// A concurrent render errored and a synchronous retry succeeded.
    fn on_recoverable_error(&self, _error: &ComponentError, _info: &ErrorInfo) {}

    /// A root was unmounted.
    fn on_unmount(&self, _root: RootId) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ReconcilerObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keeps_error_logging() {
        let observer = NoopObserver;
        assert!(observer.on_uncaught_error(&ComponentError::new("x"), &ErrorInfo::default()));
    }
}
