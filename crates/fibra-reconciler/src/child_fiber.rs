#![forbid(unsafe_code)]

//! Child reconciliation: new elements against the current child list.
//!
//! Children are matched first by a linear scan while keys line up, then
//! through a key (or position) map for whatever is left. Matched fibers are
//! reused through their alternate; unmatched old fibers are queued on the
//! parent's deletion list and unmatched elements become new fibers.
//!
//! Moves are minimal: among reused children, the longest run whose old
//! positions still increase stays where it is and only the rest are flagged
//! [`Flags::PLACEMENT`].
//!
//! # Invariants
//!
//! - Side effects (placement, deletion) are only recorded when tracking,
//!   that is when the parent already had a committed child list.
//! - A single unkeyed fragment child is transparent: its children are
//!   reconciled in its place.
//! - `index` of every returned fiber is its position in the new list.

use ahash::{AHashMap, AHashSet};
use fibra_core::{FiberId, Flags, HostConfig, Lanes};
use smallvec::SmallVec;

use crate::element::{Element, Key};
use crate::fiber::Fiber;
use crate::reconciler::Reconciler;

#[derive(Clone, PartialEq, Eq, Hash)]
enum ChildKey {
    Key(Key),
    Index(usize),
}

/// Positions (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let at = tails.partition_point(|&t| seq[t] < value);
        if at > 0 {
            prev[i] = Some(tails[at - 1]);
        }
        if at == tails.len() {
            tails.push(i);
        } else {
            tails[at] = i;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        out.push(i);
        cursor = prev[i];
    }
    out.reverse();
    out
}

impl<H: HostConfig> Reconciler<H> {
    /// Reconcile `children` under `wip` and set its child pointer.
    pub(crate) fn reconcile_children(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        children: &[Element],
        render_lanes: Lanes,
    ) {
        let child = match current {
            Some(cur) => {
                let first = self.fibers[cur].child;
                self.reconcile_child_fibers(wip, first, children, render_lanes, true)
            }
            None => self.reconcile_child_fibers(wip, None, children, render_lanes, false),
        };
        self.fibers[wip].child = child;
    }

    /// Reconcile `children` of `parent` against `current_first` and its
    /// siblings; returns the new first child.
    pub(crate) fn reconcile_child_fibers(
        &mut self,
        parent: FiberId,
        current_first: Option<FiberId>,
        children: &[Element],
        lanes: Lanes,
        track: bool,
    ) -> Option<FiberId> {
        match children {
            [only] if only.is_unkeyed_fragment() => {
                self.reconcile_child_fibers(parent, current_first, only.props.children(), lanes, track)
            }
            [] => {
                if track {
                    self.delete_remaining_children(parent, current_first);
                }
                None
            }
            [single] => {
                let fiber = self.reconcile_single_element(parent, current_first, single, lanes, track);
                if track && self.fibers[fiber].alternate.is_none() {
                    self.fibers[fiber].flags |= Flags::PLACEMENT;
                }
                Some(fiber)
            }
            _ => self.reconcile_children_array(parent, current_first, children, lanes, track),
        }
    }

    fn delete_child(&mut self, parent: FiberId, child: FiberId) {
        let p = &mut self.fibers[parent];
        p.deletions.push(child);
        p.flags |= Flags::CHILD_DELETION;
    }

    fn delete_remaining_children(&mut self, parent: FiberId, first: Option<FiberId>) {
        let mut child = first;
        while let Some(c) = child {
            self.delete_child(parent, c);
            child = self.fibers[c].sibling;
        }
    }

    /// Alternate of `fiber` reset for reuse at index 0 with no siblings.
    fn use_fiber(&mut self, fiber: FiberId, element: &Element, parent: FiberId) -> FiberId {
        let wip = self.create_work_in_progress(fiber, element.props.clone());
        let f = &mut self.fibers[wip];
        f.index = 0;
        f.sibling = None;
        f.ref_ = element.ref_.clone();
        f.return_ = Some(parent);
        wip
    }

    fn create_child(&mut self, parent: FiberId, element: &Element, lanes: Lanes) -> FiberId {
        let mode = self.fibers[parent].mode;
        let mut fiber = Fiber::from_element(element, mode, lanes);
        fiber.return_ = Some(parent);
        self.fibers.insert(fiber)
    }

    fn same_type(&self, fiber: FiberId, element: &Element) -> bool {
        self.fibers[fiber]
            .element_type
            .as_ref()
            .is_some_and(|ty| ty.same_type(&element.ty))
    }

    fn reconcile_single_element(
        &mut self,
        parent: FiberId,
        current_first: Option<FiberId>,
        element: &Element,
        lanes: Lanes,
        track: bool,
    ) -> FiberId {
        let mut child = current_first;
        while let Some(c) = child {
            if self.fibers[c].key == element.key {
                if self.same_type(c, element) {
                    if track {
                        let rest = self.fibers[c].sibling;
                        self.delete_remaining_children(parent, rest);
                    }
                    return self.use_fiber(c, element, parent);
                }
                // Same key, different type: nothing further can match.
                if track {
                    self.delete_remaining_children(parent, Some(c));
                }
                break;
            }
            if track {
                self.delete_child(parent, c);
            }
            child = self.fibers[c].sibling;
        }
        self.create_child(parent, element, lanes)
    }

    /// Reuse `old` for `element` if the types match, else create a fiber.
    fn update_element(&mut self, parent: FiberId, old: Option<FiberId>, element: &Element, lanes: Lanes) -> FiberId {
        match old {
            Some(o) if self.same_type(o, element) => self.use_fiber(o, element, parent),
            _ => self.create_child(parent, element, lanes),
        }
    }

    fn reconcile_children_array(
        &mut self,
        parent: FiberId,
        current_first: Option<FiberId>,
        children: &[Element],
        lanes: Lanes,
        track: bool,
    ) -> Option<FiberId> {
        // (new fiber, old index if reused)
        let mut placed: SmallVec<[(FiberId, Option<usize>); 8]> = SmallVec::with_capacity(children.len());
        let mut old = current_first;
        let mut new_idx = 0;

        // Aligned scan while keys match position by position.
        while let Some(o) = old
            && new_idx < children.len()
        {
            let element = &children[new_idx];
            if self.fibers[o].key != element.key {
                break;
            }
            let next_old = self.fibers[o].sibling;
            let fiber = self.update_element(parent, Some(o), element, lanes);
            let reused = self.fibers[fiber].alternate == Some(o);
            if track && !reused {
                self.delete_child(parent, o);
            }
            placed.push((fiber, reused.then(|| self.fibers[o].index)));
            old = next_old;
            new_idx += 1;
        }

        if new_idx == children.len() {
            if track {
                self.delete_remaining_children(parent, old);
            }
            return self.link_children(&placed, track);
        }

        if old.is_none() {
            for element in &children[new_idx..] {
                let fiber = self.create_child(parent, element, lanes);
                placed.push((fiber, None));
            }
            return self.link_children(&placed, track);
        }

        // Keyed (or positional) lookup for the rest.
        let mut existing: AHashMap<ChildKey, FiberId> = AHashMap::new();
        let mut remaining_order = Vec::new();
        let mut cursor = old;
        while let Some(c) = cursor {
            let f = &self.fibers[c];
            let key = match &f.key {
                Some(k) => ChildKey::Key(k.clone()),
                None => ChildKey::Index(f.index),
            };
            existing.insert(key, c);
            remaining_order.push(c);
            cursor = f.sibling;
        }
        let mut consumed: AHashSet<FiberId> = AHashSet::new();
        for (offset, element) in children[new_idx..].iter().enumerate() {
            let key = match &element.key {
                Some(k) => ChildKey::Key(k.clone()),
                None => ChildKey::Index(new_idx + offset),
            };
            // Each old fiber matches at most once; a repeated key gets a new fiber.
            let matched = existing.remove(&key);
            let fiber = self.update_element(parent, matched, element, lanes);
            let reused = matched.filter(|m| self.fibers[fiber].alternate == Some(*m));
            if let Some(m) = reused {
                consumed.insert(m);
            }
            placed.push((fiber, reused.map(|m| self.fibers[m].index)));
        }
        if track {
            for c in remaining_order {
                if !consumed.contains(&c) {
                    self.delete_child(parent, c);
                }
            }
        }
        self.link_children(&placed, track)
    }

    /// Link `placed` as a sibling chain, assign indices and flag moves.
    fn link_children(&mut self, placed: &[(FiberId, Option<usize>)], track: bool) -> Option<FiberId> {
        if track {
            let reused: Vec<(FiberId, usize)> = placed
                .iter()
                .filter_map(|(f, old)| old.map(|o| (*f, o)))
                .collect();
            let old_indices: Vec<usize> = reused.iter().map(|(_, o)| *o).collect();
            let stay: AHashSet<FiberId> = longest_increasing_subsequence(&old_indices)
                .into_iter()
                .map(|i| reused[i].0)
                .collect();
            for (fiber, _) in placed {
                if !stay.contains(fiber) {
                    self.fibers[*fiber].flags |= Flags::PLACEMENT;
                }
            }
        }
        let mut prev: Option<FiberId> = None;
        for (index, (fiber, _)) in placed.iter().enumerate() {
            self.fibers[*fiber].index = index;
            self.fibers[*fiber].sibling = None;
            if let Some(p) = prev {
                self.fibers[p].sibling = Some(*fiber);
            }
            prev = Some(*fiber);
        }
        placed.first().map(|(f, _)| *f)
    }

    /// Point `wip.child` at fresh alternates of the current children.
    pub(crate) fn clone_child_fibers(&mut self, wip: FiberId) {
        let Some(first) = self.fibers[wip].child else { return };
        let mut current_child = Some(first);
        let mut prev: Option<FiberId> = None;
        while let Some(cur) = current_child {
            let props = self.fibers[cur].pending_props.clone();
            let next = self.create_work_in_progress(cur, props);
            self.fibers[next].return_ = Some(wip);
            self.fibers[next].sibling = None;
            match prev {
                Some(p) => self.fibers[p].sibling = Some(next),
                None => self.fibers[wip].child = Some(next),
            }
            prev = Some(next);
            current_child = self.fibers[cur].sibling;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_the_longest_ordered_run() {
        // [A,B,C] -> [C,A,B]: old positions 2,0,1; A and B stay.
        assert_eq!(longest_increasing_subsequence(&[2, 0, 1]), vec![1, 2]);
    }

    #[test]
    fn unchanged_order_moves_nothing() {
        assert_eq!(longest_increasing_subsequence(&[0, 1, 2, 3]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reversal_keeps_one() {
        assert_eq!(longest_increasing_subsequence(&[3, 2, 1, 0]).len(), 1);
    }

    #[test]
    fn empty_input() {
        assert!(longest_increasing_subsequence(&[]).is_empty());
    }
}
