#![forbid(unsafe_code)]

//! Core: lanes, effect flags, and the host/scheduler contracts.
//!
//! # Role in fibra
//! `fibra-core` holds everything the reconciler and its embedders must agree
//! on without depending on the reconciler itself.
//!
//! # Primary responsibilities
//! - **Lanes**: the 31-bit priority set and per-root lane bookkeeping.
//! - **Flags**: fiber effect flags, hook effect tags and modes.
//! - **HostConfig**: the mutation-mode host contract.
//! - **Scheduler**: task-as-data scheduling contract.
//! - **Errors**: fatal invariant errors versus routable component errors.
//!
//! # How it fits in the system
//! `fibra-reconciler` drives a [`host::HostConfig`] and a
//! [`scheduler::Scheduler`]. `fibra-harness` provides in-memory versions of
//! both for tests.

pub mod attribute_payload;
pub mod config;
pub mod error;
pub mod flags;
pub mod host;
pub mod ids;
pub mod lane;
pub mod props;
pub mod scheduler;
pub mod wakeable;

pub use config::{ConfigError, ReconcilerConfig};
pub use error::{ComponentError, InvariantViolation, ReconcilerError, Throw};
pub use flags::{Flags, HookFlags, Mode};
pub use host::{HostChild, HostConfig, HostNode};
pub use ids::{FiberId, HostNodeId, PortalId, RootId};
pub use lane::{Lane, Lanes, RootLanes};
pub use props::{PropMap, PropValue};
pub use scheduler::{
    CallbackHandle, EventPriority, NO_TIMESTAMP, Scheduler, SchedulerPriority, Task, TaskStatus,
    Timestamp,
};
pub use wakeable::{Wakeable, WakeableStatus};
