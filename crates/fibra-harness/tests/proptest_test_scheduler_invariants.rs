//! Property-based invariant tests for the virtual-clock scheduler.
//!
//! For any mix of scheduled, delayed and cancelled tasks:
//!
//! 1. Ready tasks come out ordered by expiration, then by scheduling order.
//! 2. A delayed task never comes out before the clock reaches its start.
//! 3. Every task that was not cancelled comes out exactly once.
//! 4. `should_yield` only fires after the slice budget is spent.

use std::collections::HashSet;

use fibra_core::{CallbackHandle, Scheduler, SchedulerPriority, Task};
use fibra_harness::TestScheduler;
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

fn priority() -> impl Strategy<Value = SchedulerPriority> {
    prop_oneof![
        Just(SchedulerPriority::Immediate),
        Just(SchedulerPriority::UserBlocking),
        Just(SchedulerPriority::Normal),
        Just(SchedulerPriority::Low),
        Just(SchedulerPriority::Idle),
    ]
}

/// One scheduling step: priority, optional delay, clock advance before it.
fn step() -> impl Strategy<Value = (SchedulerPriority, Option<i64>, i64)> {
    (priority(), proptest::option::of(0..500_i64), 0..50_i64)
}

fn schedule_all(
    scheduler: &TestScheduler,
    steps: &[(SchedulerPriority, Option<i64>, i64)],
) -> Vec<CallbackHandle> {
    steps
        .iter()
        .map(|(priority, delay, advance)| {
            scheduler.advance(*advance);
            scheduler.schedule_callback(*priority, Task::ProcessUpdates, *delay)
        })
        .collect()
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Ready tasks run in expiration order
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn ready_tasks_pop_in_expiration_order(
        steps in proptest::collection::vec((priority(), 0..50_i64), 1..24),
    ) {
        let scheduler = TestScheduler::new();
        for (priority, advance) in &steps {
            scheduler.advance(*advance);
            scheduler.schedule_callback(*priority, Task::FlushSyncQueue, None);
        }

        let mut popped = Vec::new();
        while let Some(task) = scheduler.pop_ready() {
            popped.push((task.expiration, task.handle.raw()));
        }
        prop_assert_eq!(popped.len(), steps.len());
        prop_assert!(popped.windows(2).all(|w| w[0] < w[1]), "{:?}", popped);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2-3. Delays are honoured; survivors run exactly once
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn delayed_and_cancelled_tasks_are_respected(
        steps in proptest::collection::vec(step(), 1..24),
        cancel in proptest::collection::vec(any::<bool>(), 24),
    ) {
        let scheduler = TestScheduler::new();
        let handles = schedule_all(&scheduler, &steps);
        let mut expected: HashSet<CallbackHandle> = HashSet::new();
        for (handle, cancelled) in handles.iter().zip(&cancel) {
            if *cancelled {
                scheduler.cancel_callback(*handle);
            } else {
                expected.insert(*handle);
            }
        }

        let mut seen: HashSet<CallbackHandle> = HashSet::new();
        loop {
            while let Some(task) = scheduler.pop_ready() {
                prop_assert!(task.start <= scheduler.now());
                prop_assert!(seen.insert(task.handle), "{} ran twice", task.handle);
            }
            match scheduler.next_delayed_start() {
                Some(start) => scheduler.advance(start - scheduler.now()),
                None => break,
            }
        }
        prop_assert!(scheduler.is_idle());
        prop_assert_eq!(seen, expected);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Slices
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn should_yield_respects_the_slice(limit in 0..16_u32, checks in 0..40_u32) {
        let scheduler = TestScheduler::new();
        scheduler.set_slice(Some(limit));
        scheduler.begin_slice();
        for used in 1..=checks {
            prop_assert_eq!(scheduler.should_yield(), used > limit);
        }

        scheduler.begin_slice();
        if limit > 0 {
            prop_assert!(!scheduler.should_yield());
        }
    }
}
