#![forbid(unsafe_code)]

//! Fibra Reconciler
//!
//! An incremental tree reconciler: components describe a tree of elements,
//! the reconciler diffs each new description against the committed one and
//! applies the minimal set of mutations to a host through
//! [`fibra_core::HostConfig`].
//!
//! # Key Components
//!
//! - [`Reconciler`] - owns the fiber arena and every root; the public API
//! - [`Element`] - immutable description of what to render
//! - [`Hooks`] - state, effects, context, transitions and stores for
//!   function components
//! - [`ClassComponent`] - lifecycle-based components and error boundaries
//! - [`ReconcilerObserver`] - commit and error notifications
//!
//! # Role in fibra
//! `fibra-reconciler` is the engine. It renders on priority lanes from
//! `fibra-core`, yields to the embedder's [`fibra_core::Scheduler`] between
//! units of work, and commits in before-mutation, mutation, layout and
//! passive phases.
//!
//! # How it fits in the system
//! Embedders implement `HostConfig` and `Scheduler`, then call
//! [`Reconciler::run_task`] for every task the scheduler was handed.
//! `fibra-harness` provides in-memory implementations of both for tests.

mod begin_work;
mod child_fiber;
mod class_component;
mod commit;
mod complete_work;
mod component;
mod context;
mod element;
mod fiber;
mod hooks;
mod observer;
mod passive;
mod reconciler;
mod root_scheduler;
mod shared;
mod suspense;
mod throw;
mod update_queue;
mod work_loop;

pub use class_component::Updater;
pub use component::{
    ClassComponent, ClassDef, ClassState, ErrorInfo, FunctionComponent, LazyComponent, LazyResolver,
    MemoComponent, ProfilerDef, ProfilerPhase, ProfilerReport, RenderResult,
};
pub use context::{Context, ContextDef};
pub use element::{
    Element, ElementType, Key, OffscreenMode, Props, RefObject, RevealOrder, SuspenseListConfig, TailMode,
};
pub use fiber::RootTag;
pub use hooks::{
    Cleanup, Dispatch, Hooks, IntoCleanup, StateSetter, StoreListener, Subscribe, TransitionStarter,
};
pub use observer::{NoopObserver, ReconcilerObserver};
pub use reconciler::Reconciler;

pub use fibra_core;
