#![forbid(unsafe_code)]

//! Scheduler contract.
//!
//! The reconciler never owns a clock or a task queue. It hands *tasks as
//! data* to an injected [`Scheduler`] and is later asked to run them through
//! the reconciler's `run_task` entry point. This keeps the reconciler free of
//! callbacks that would need to borrow it.
//!
//! # Priorities
//!
//! | Event priority | Lane             | Scheduler priority |
//! |----------------|------------------|--------------------|
//! | Discrete       | sync             | Immediate          |
//! | Continuous     | input-continuous | UserBlocking       |
//! | Default        | default          | Normal             |
//! | Idle           | idle             | Idle               |

use std::fmt;

use crate::ids::RootId;
use crate::lane::{Lane, Lanes};

/// Milliseconds on the scheduler clock.
pub type Timestamp = i64;

/// Sentinel for "no timestamp recorded".
pub const NO_TIMESTAMP: Timestamp = -1;

/// Scheduler-level priority of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchedulerPriority {
    Immediate,
    UserBlocking,
    Normal,
    Low,
    Idle,
}

impl SchedulerPriority {
    /// Timeout after which a task of this priority counts as overdue.
    #[must_use]
    pub const fn timeout_ms(self) -> Timestamp {
        match self {
            Self::Immediate => -1,
            Self::UserBlocking => 250,
            Self::Normal => 5000,
            Self::Low => 10_000,
            // Effectively never.
            Self::Idle => 1_073_741_823,
        }
    }
}

/// Priority of the host event currently being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPriority {
    Discrete,
    Continuous,
    Default,
    Idle,
}

impl EventPriority {
    /// The lane updates requested under this priority receive.
    #[must_use]
    pub const fn lane(self) -> Lane {
        match self {
            Self::Discrete => Lanes::SYNC,
            Self::Continuous => Lanes::INPUT_CONTINUOUS,
            Self::Default => Lanes::DEFAULT,
            Self::Idle => Lanes::IDLE,
        }
    }

    /// The event priority matching the highest-priority lane of `lanes`.
    #[must_use]
    pub fn from_lanes(lanes: Lanes) -> Self {
        let lane = lanes.highest_priority_lane();
        if !Lanes::SYNC.is_higher_priority_than(lane) {
            return Self::Discrete;
        }
        if !Lanes::INPUT_CONTINUOUS.is_higher_priority_than(lane) {
            return Self::Continuous;
        }
        if lane.includes_non_idle_work() {
            return Self::Default;
        }
        Self::Idle
    }

    /// The lower (numerically larger lane) of two priorities.
    #[must_use]
    pub fn lower(a: Self, b: Self) -> Self {
        if a.lane().bits() > b.lane().bits() { a } else { b }
    }

    /// The higher of two priorities.
    #[must_use]
    pub fn higher(a: Self, b: Self) -> Self {
        if a.lane().bits() < b.lane().bits() { a } else { b }
    }

    #[must_use]
    pub const fn scheduler_priority(self) -> SchedulerPriority {
        match self {
            Self::Discrete => SchedulerPriority::Immediate,
            Self::Continuous => SchedulerPriority::UserBlocking,
            Self::Default => SchedulerPriority::Normal,
            Self::Idle => SchedulerPriority::Idle,
        }
    }
}

/// Opaque handle returned by [`Scheduler::schedule_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Work the reconciler asks the scheduler to run later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Render (and possibly commit) pending concurrent work on a root.
    PerformWork(RootId),
    /// Drain the synchronous root queue.
    FlushSyncQueue,
    /// Run pending passive effects.
    FlushPassiveEffects,
    /// Apply updates dispatched from outside the reconciler.
    ProcessUpdates,
    /// Commit a root whose commit was delayed to throttle fallbacks.
    CommitSuspended(RootId),
}

impl Task {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PerformWork(_) => "perform_work",
            Self::FlushSyncQueue => "flush_sync_queue",
            Self::FlushPassiveEffects => "flush_passive_effects",
            Self::ProcessUpdates => "process_updates",
            Self::CommitSuspended(_) => "commit_suspended",
        }
    }
}

/// What happened when a task ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is finished.
    Done,
    /// The task yielded; run the same handle again later.
    Continue,
}

/// Cooperative task scheduler supplied by the embedder.
pub trait Scheduler {
    /// Queue `task` at `priority`, optionally delayed by `delay_ms`.
    fn schedule_callback(
        &self,
        priority: SchedulerPriority,
        task: Task,
        delay_ms: Option<Timestamp>,
    ) -> CallbackHandle;

    /// Drop a queued task. Unknown handles are ignored.
    fn cancel_callback(&self, handle: CallbackHandle);

    /// True when the current time slice is spent.
    fn should_yield(&self) -> bool;

    /// Hint that the host should paint before the next slice.
    fn request_paint(&self) {}

    /// Current time in milliseconds.
    fn now(&self) -> Timestamp;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_priority_round_trips_through_lanes() {
        for p in [
            EventPriority::Discrete,
            EventPriority::Continuous,
            EventPriority::Default,
            EventPriority::Idle,
        ] {
            assert_eq!(EventPriority::from_lanes(p.lane()), p);
        }
    }

    #[test]
    fn transition_lanes_map_to_default_priority() {
        assert_eq!(
            EventPriority::from_lanes(Lanes::TRANSITION_1),
            EventPriority::Default
        );
        assert_eq!(
            EventPriority::from_lanes(Lanes::OFFSCREEN),
            EventPriority::Idle
        );
    }

    #[test]
    fn lower_and_higher_are_symmetric() {
        let (a, b) = (EventPriority::Discrete, EventPriority::Default);
        assert_eq!(EventPriority::lower(a, b), b);
        assert_eq!(EventPriority::higher(a, b), a);
    }
}
