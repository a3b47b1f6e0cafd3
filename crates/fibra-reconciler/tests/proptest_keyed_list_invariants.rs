//! Property-based invariant tests for keyed child reconciliation.
//!
//! For any pair of keyed lists rendered one after the other:
//!
//! 1. The host children end up in the order of the second list.
//! 2. Items present in both lists keep their host node.
//! 3. Dropping items without reordering never moves a node.
//! 4. The host contract is never violated.
//! 5. Unmounting leaves an empty container.

use std::collections::HashMap;

use fibra_harness::{Harness, NodeId};
use fibra_reconciler::Element;
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

fn keyed_list(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    proptest::sample::subsequence((0..max_len as u8).collect::<Vec<_>>(), 0..=max_len)
        .prop_flat_map(|keys| Just(keys).prop_shuffle())
}

fn render_list(keys: &[u8]) -> Element {
    Element::host("ul").children(
        keys.iter()
            .map(|k| Element::host("li").key(k.to_string()).attr("id", i64::from(*k))),
    )
}

fn mounted(keys: &[u8]) -> (Harness, NodeId) {
    let mut h = Harness::legacy();
    h.render(render_list(keys)).expect("render");
    let ul = h.host().container_children(h.container())[0];
    (h, ul)
}

fn ids(h: &Harness, ul: NodeId) -> Vec<i64> {
    h.host()
        .children(ul)
        .into_iter()
        .map(|n| h.host().prop(n, "id").and_then(|v| v.as_int()).expect("li has an id"))
        .collect()
}

fn nodes_by_key(h: &Harness, ul: NodeId, keys: &[u8]) -> HashMap<u8, NodeId> {
    keys.iter().copied().zip(h.host().children(ul)).collect()
}

// ═════════════════════════════════════════════════════════════════════════
// 1-2. Order follows the new list; shared keys keep their nodes
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn reorders_match_the_new_list(before in keyed_list(12), after in keyed_list(12)) {
        let (mut h, ul) = mounted(&before);
        let old_nodes = nodes_by_key(&h, ul, &before);

        h.render(render_list(&after)).expect("render");
        let expected: Vec<i64> = after.iter().map(|k| i64::from(*k)).collect();
        prop_assert_eq!(ids(&h, ul), expected);

        let new_nodes = nodes_by_key(&h, ul, &after);
        for (key, node) in &new_nodes {
            if let Some(old) = old_nodes.get(key) {
                prop_assert_eq!(old, node, "key {} was recreated", key);
            }
        }
        prop_assert!(h.host().violations().is_empty(), "{:?}", h.host().violations());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Removals alone never move nodes
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn removals_never_move_survivors(
        before in keyed_list(12),
        keep in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let (mut h, _ul) = mounted(&before);
        h.host_mut().take_log();

        let after: Vec<u8> = before
            .iter()
            .zip(&keep)
            .filter_map(|(k, keep)| keep.then_some(*k))
            .collect();
        h.render(render_list(&after)).expect("render");
        let log = h.host_mut().take_log();
        prop_assert!(log.iter().all(|op| !op.is_placement()), "{:?}", log);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4-5. Contract holds across a sequence of renders, then unmount
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn render_sequences_keep_the_host_consistent(
        lists in proptest::collection::vec(keyed_list(8), 1..6),
    ) {
        let mut h = Harness::legacy();
        for keys in &lists {
            h.render(render_list(keys)).expect("render");
            prop_assert!(h.host().violations().is_empty(), "{:?}", h.host().violations());
        }
        h.unmount().expect("unmount");
        prop_assert_eq!(h.markup(), "");
        prop_assert!(h.host().violations().is_empty());
    }
}
