//! Property tests for lane selection and root lane bookkeeping.

use fibra_core::lane::{ExpirationWindows, LaneAllocator, get_highest_priority_lanes};
use fibra_core::{Lanes, RootLanes};
use proptest::prelude::*;

fn lanes() -> impl Strategy<Value = Lanes> {
    any::<u32>().prop_map(Lanes::from_bits)
}

mod selection {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        #[test]
        fn next_lanes_are_pending(pending in lanes(), suspended in lanes()) {
            let mut root = RootLanes::new();
            root.pending = pending;
            root.suspended = suspended;
            let next = root.get_next_lanes(Lanes::NONE);
            prop_assert!(pending.contains(next));
        }

        #[test]
        fn highest_unsuspended_non_idle_lane_wins(pending in lanes(), suspended in lanes()) {
            let mut root = RootLanes::new();
            root.pending = pending;
            root.suspended = suspended;
            let next = root.get_next_lanes(Lanes::NONE);
            let candidates = (pending & Lanes::NON_IDLE).remove(suspended);
            if !candidates.is_empty() {
                prop_assert_eq!(
                    next.highest_priority_lane(),
                    candidates.highest_priority_lane()
                );
            }
        }

        #[test]
        fn in_progress_work_is_kept_unless_preempted(pending in lanes(), wip in lanes()) {
            let mut root = RootLanes::new();
            root.pending = pending;
            let fresh = root.get_next_lanes(Lanes::NONE);
            let next = root.get_next_lanes(wip);
            if fresh.highest_priority_lane().is_higher_priority_than(wip.highest_priority_lane())
                && !(fresh.highest_priority_lane() == Lanes::DEFAULT
                    && wip.highest_priority_lane().is_transition_lane())
            {
                prop_assert_eq!(next, fresh);
            }
        }

        #[test]
        fn group_is_a_subset(set in lanes()) {
            let group = get_highest_priority_lanes(set);
            prop_assert!(set.contains(group));
            prop_assert_eq!(group.is_empty(), set.is_empty());
        }
    }
}

mod bookkeeping {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn pinged_stays_within_suspended(suspended in lanes(), pinged in lanes()) {
            let mut root = RootLanes::new();
            root.mark_root_suspended(suspended);
            root.mark_root_pinged(pinged);
            prop_assert!(root.suspended.contains(root.pinged));
        }

        #[test]
        fn finished_leaves_only_remaining(pending in lanes(), remaining in lanes()) {
            let mut root = RootLanes::new();
            for (_, lane) in pending {
                root.mark_root_updated(lane, 1);
            }
            root.mark_starved_lanes_as_expired(1, &ExpirationWindows::default());
            root.mark_root_finished(remaining);
            prop_assert_eq!(root.pending, remaining);
            prop_assert!(remaining.contains(root.expired));
            for (index, _) in pending.remove(remaining) {
                prop_assert_eq!(root.expiration_times[index], fibra_core::NO_TIMESTAMP);
            }
        }

        #[test]
        fn expired_lanes_only_grow_with_time(step in 1i64..10_000) {
            let windows = ExpirationWindows::default();
            let mut root = RootLanes::new();
            root.mark_root_updated(Lanes::DEFAULT, 0);
            root.mark_root_updated(Lanes::SYNC, 0);
            root.mark_starved_lanes_as_expired(0, &windows);
            let mut last = root.expired;
            let mut now = 0;
            for _ in 0..8 {
                now += step;
                root.mark_starved_lanes_as_expired(now, &windows);
                prop_assert!(root.expired.contains(last));
                last = root.expired;
            }
        }

        #[test]
        fn claimed_transition_lanes_are_single_bits(n in 1usize..64) {
            let alloc = LaneAllocator::new();
            for _ in 0..n {
                let lane = alloc.claim_next_transition_lane();
                prop_assert_eq!(lane.bits().count_ones(), 1);
                prop_assert!(lane.includes_only_transitions());
            }
        }
    }
}
