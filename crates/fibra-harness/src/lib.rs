#![forbid(unsafe_code)]

//! Fibra Harness
//!
//! Deterministic fixtures for exercising the reconciler without a real UI.
//!
//! # Key Components
//!
//! - [`TestHost`] - in-memory host tree with an operation log and contract
//!   checks
//! - [`TestScheduler`] - virtual clock, expiration-ordered task queue and
//!   configurable time slices
//! - [`Harness`] - one root wired to both, with helpers to pump tasks
//! - [`with_captured_tracing`] - records spans and events for assertions
//!
//! # How it fits in the system
//! `fibra-reconciler` integration tests build a [`Harness`], render
//! elements, and assert on [`TestHost::markup`], the host log, and the
//! component-side [`Log`].

pub mod harness;
pub mod test_host;
pub mod test_scheduler;
pub mod trace_capture;

pub use harness::{Harness, Log, RecordingObserver};
pub use test_host::{ContainerId, HostOp, NodeId, TEXT_CONTENT, TestContext, TestHost};
pub use test_scheduler::{QueuedTask, TestScheduler};
pub use trace_capture::{CaptureHandle, CapturedEvent, CapturedSpan, with_captured_tracing};
