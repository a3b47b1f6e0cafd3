//! Property-based invariant tests for hook update ordering across lanes.
//!
//! For any batch of state updates, each dispatched either at discrete
//! priority or inside a transition:
//!
//! 1. The sync commit shows the discrete updates applied in order, with the
//!    transition updates skipped.
//! 2. The final commit shows every update applied in dispatch order, as if
//!    no update had been skipped.

use std::cell::RefCell;
use std::rc::Rc;

use fibra_harness::Harness;
use fibra_reconciler::fibra_core::EventPriority;
use fibra_reconciler::{Element, FunctionComponent, StateSetter};
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Op {
    Add(i64),
    Mul(i64),
}

impl Op {
    fn apply(self, n: i64) -> i64 {
        match self {
            Op::Add(k) => n.wrapping_add(k),
            Op::Mul(k) => n.wrapping_mul(k),
        }
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(1..10_i64).prop_map(Op::Add), (2..5_i64).prop_map(Op::Mul)]
}

/// An update and whether it is dispatched as a transition.
fn updates() -> impl Strategy<Value = Vec<(Op, bool)>> {
    proptest::collection::vec((op(), any::<bool>()), 1..12)
}

const INITIAL: i64 = 1;

fn mounted() -> (Harness, StateSetter<i64>) {
    let slot: Rc<RefCell<Option<StateSetter<i64>>>> = Rc::default();
    let stash = slot.clone();
    let value = FunctionComponent::new("Value", move |_props, hooks| {
        let (n, set) = hooks.use_state(|| INITIAL);
        *stash.borrow_mut() = Some(set);
        Ok(Element::text(n.to_string()))
    });
    let mut h = Harness::concurrent();
    h.render(Element::component(&value)).expect("render");
    let set = slot.borrow().clone().expect("rendered");
    (h, set)
}

fn fold(updates: &[(Op, bool)], include_transitions: bool) -> i64 {
    updates
        .iter()
        .filter(|(_, transition)| include_transitions || !transition)
        .fold(INITIAL, |n, (op, _)| op.apply(n))
}

// ═════════════════════════════════════════════════════════════════════════
// 1-2. Sync commit skips transitions; final commit replays everything
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn updates_commit_in_dispatch_order(updates in updates()) {
        let (mut h, set) = mounted();
        h.reconciler
            .batched_updates(|r| {
                for (op, transition) in &updates {
                    let (op, set) = (*op, set.clone());
                    if *transition {
                        r.start_transition(move |_| set.update(move |n| op.apply(*n)))
                            .expect("transition");
                    } else {
                        r.with_event_priority(EventPriority::Discrete, move |_| {
                            set.update(move |n| op.apply(*n));
                        })
                        .expect("event");
                    }
                }
            })
            .expect("batch");
        prop_assert_eq!(h.text(), fold(&updates, false).to_string());

        h.flush_all().expect("flush");
        prop_assert_eq!(h.text(), fold(&updates, true).to_string());
        prop_assert!(h.pending_lanes().is_empty());
    }
}
