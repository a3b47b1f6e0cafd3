#![forbid(unsafe_code)]

//! Priority lanes.
//!
//! A [`Lanes`] value is a 31-bit set. Each bit is a *lane*: a priority class
//! that pending work can be tagged with. Lower bit positions are higher
//! priority, so the highest-priority lane of a set is its lowest set bit.
//!
//! # Layout
//!
//! | Bits    | Lane(s)                          |
//! |---------|----------------------------------|
//! | 0       | sync                             |
//! | 1       | input-continuous hydration       |
//! | 2       | input-continuous                 |
//! | 3       | default hydration                |
//! | 4       | default                          |
//! | 5       | transition hydration             |
//! | 6..=21  | 16 transition lanes              |
//! | 22..=26 | 5 retry lanes                    |
//! | 27      | selective hydration              |
//! | 28      | idle hydration                   |
//! | 29      | idle                             |
//! | 30      | offscreen                        |
//!
//! # Invariants
//!
//! 1. A lane never exceeds bit 30.
//! 2. `pinged ⊆ suspended` holds after every [`RootLanes::mark_root_pinged`].
//! 3. Entangled lanes are always selected together by [`RootLanes::get_next_lanes`].
//!
//! # Failure Modes
//!
//! Every operation is total. Timestamps use [`NO_TIMESTAMP`] to mean "unset".

use std::cell::Cell;
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use crate::scheduler::{NO_TIMESTAMP, Timestamp};

/// Number of addressable lanes.
pub const TOTAL_LANES: usize = 31;

const ALL_BITS: u32 = (1 << TOTAL_LANES) - 1;

/// A set of lanes. A single-bit set doubles as "a lane".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Lanes(u32);

/// Alias used where the value is expected to hold exactly one bit.
pub type Lane = Lanes;

impl Lanes {
    pub const NONE: Lanes = Lanes(0);
    pub const SYNC: Lanes = Lanes(1 << 0);
    pub const INPUT_CONTINUOUS_HYDRATION: Lanes = Lanes(1 << 1);
    pub const INPUT_CONTINUOUS: Lanes = Lanes(1 << 2);
    pub const DEFAULT_HYDRATION: Lanes = Lanes(1 << 3);
    pub const DEFAULT: Lanes = Lanes(1 << 4);
    pub const TRANSITION_HYDRATION: Lanes = Lanes(1 << 5);
    pub const TRANSITIONS: Lanes = Lanes(0xFFFF << 6);
    pub const TRANSITION_1: Lanes = Lanes(1 << 6);
    pub const RETRIES: Lanes = Lanes(0x1F << 22);
    pub const RETRY_1: Lanes = Lanes(1 << 22);
    pub const SOME_RETRY: Lanes = Lanes::RETRY_1;
    pub const SELECTIVE_HYDRATION: Lanes = Lanes(1 << 27);
    pub const NON_IDLE: Lanes = Lanes((1 << 28) - 1);
    pub const IDLE_HYDRATION: Lanes = Lanes(1 << 28);
    pub const IDLE: Lanes = Lanes(1 << 29);
    pub const OFFSCREEN: Lanes = Lanes(1 << 30);

    /// Lanes that render without time slicing unless concurrent-by-default is on.
    pub const SYNC_DEFAULT: Lanes = Lanes(
        Lanes::INPUT_CONTINUOUS_HYDRATION.0
            | Lanes::INPUT_CONTINUOUS.0
            | Lanes::DEFAULT_HYDRATION.0
            | Lanes::DEFAULT.0,
    );

    const URGENT: Lanes = Lanes(Lanes::SYNC.0 | Lanes::INPUT_CONTINUOUS.0 | Lanes::DEFAULT.0);

    /// Build from raw bits; bits above lane 30 are dropped.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Lanes(bits & ALL_BITS)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn merge(self, other: Lanes) -> Lanes {
        Lanes(self.0 | other.0)
    }

    #[must_use]
    pub const fn remove(self, other: Lanes) -> Lanes {
        Lanes(self.0 & !other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: Lanes) -> Lanes {
        Lanes(self.0 & other.0)
    }

    /// True if the two sets share at least one lane.
    #[must_use]
    pub const fn includes_some(self, other: Lanes) -> bool {
        self.0 & other.0 != 0
    }

    /// True if every lane of `subset` is in `self`.
    #[must_use]
    pub const fn contains(self, subset: Lanes) -> bool {
        self.0 & subset.0 == subset.0
    }

    /// Lowest set bit.
    #[must_use]
    pub const fn highest_priority_lane(self) -> Lane {
        Lanes(self.0 & self.0.wrapping_neg())
    }

    /// Index of the highest set bit. Callers must not pass an empty set.
    #[must_use]
    pub const fn pick_arbitrary_lane_index(self) -> usize {
        31 - self.0.leading_zeros() as usize
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Lane {
        Lanes(1 << index)
    }

    /// Iterate single lanes from highest to lowest priority.
    pub fn iter(self) -> LaneIter {
        LaneIter(self.0)
    }

    /// True if `self` is a non-empty lane strictly higher priority than `other`.
    #[must_use]
    pub const fn is_higher_priority_than(self, other: Lanes) -> bool {
        self.0 != 0 && (other.0 == 0 || self.0 < other.0)
    }

    /// The higher priority of two single lanes.
    #[must_use]
    pub const fn higher_priority(a: Lane, b: Lane) -> Lane {
        if a.0 != 0 && a.0 < b.0 { a } else { b }
    }

    #[must_use]
    pub const fn includes_non_idle_work(self) -> bool {
        self.0 & Lanes::NON_IDLE.0 != 0
    }

    #[must_use]
    pub const fn includes_only_retries(self) -> bool {
        self.0 & Lanes::RETRIES.0 == self.0
    }

    #[must_use]
    pub const fn includes_only_non_urgent(self) -> bool {
        self.0 & Lanes::URGENT.0 == 0
    }

    #[must_use]
    pub const fn includes_only_transitions(self) -> bool {
        self.0 & Lanes::TRANSITIONS.0 == self.0
    }

    #[must_use]
    pub const fn includes_sync_lane(self) -> bool {
        self.0 & Lanes::SYNC.0 != 0
    }

    #[must_use]
    pub const fn is_transition_lane(self) -> bool {
        self.0 & Lanes::TRANSITIONS.0 != 0
    }

    /// Human label of the highest-priority group in the set.
    #[must_use]
    pub fn label(self) -> &'static str {
        let lane = self.highest_priority_lane();
        match lane {
            Lanes::NONE => "none",
            Lanes::SYNC => "sync",
            Lanes::INPUT_CONTINUOUS_HYDRATION => "input-continuous-hydration",
            Lanes::INPUT_CONTINUOUS => "input-continuous",
            Lanes::DEFAULT_HYDRATION => "default-hydration",
            Lanes::DEFAULT => "default",
            Lanes::TRANSITION_HYDRATION => "transition-hydration",
            Lanes::SELECTIVE_HYDRATION => "selective-hydration",
            Lanes::IDLE_HYDRATION => "idle-hydration",
            Lanes::IDLE => "idle",
            Lanes::OFFSCREEN => "offscreen",
            l if l.includes_some(Lanes::TRANSITIONS) => "transition",
            l if l.includes_some(Lanes::RETRIES) => "retry",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Lanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lanes({:#b})", self.0)
    }
}

impl fmt::Display for Lanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        let mut last = "";
        for (_, lane) in self.iter().collect::<Vec<_>>().into_iter().rev() {
            let label = lane.label();
            if label == last {
                continue;
            }
            if !first {
                f.write_str("|")?;
            }
            f.write_str(label)?;
            first = false;
            last = label;
        }
        Ok(())
    }
}

impl BitOr for Lanes {
    type Output = Lanes;
    fn bitor(self, rhs: Lanes) -> Lanes {
        self.merge(rhs)
    }
}

impl BitOrAssign for Lanes {
    fn bitor_assign(&mut self, rhs: Lanes) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Lanes {
    type Output = Lanes;
    fn bitand(self, rhs: Lanes) -> Lanes {
        self.intersect(rhs)
    }
}

impl BitAndAssign for Lanes {
    fn bitand_assign(&mut self, rhs: Lanes) {
        self.0 &= rhs.0;
    }
}

impl Not for Lanes {
    type Output = Lanes;
    fn not(self) -> Lanes {
        Lanes(!self.0 & ALL_BITS)
    }
}

/// Iterator over the single lanes of a set, highest bit first.
#[derive(Debug, Clone)]
pub struct LaneIter(u32);

impl Iterator for LaneIter {
    type Item = (usize, Lane);

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            return None;
        }
        let index = 31 - self.0.leading_zeros() as usize;
        let lane = 1u32 << index;
        self.0 &= !lane;
        Some((index, Lanes(lane)))
    }
}

impl IntoIterator for Lanes {
    type Item = (usize, Lane);
    type IntoIter = LaneIter;
    fn into_iter(self) -> LaneIter {
        self.iter()
    }
}

// ---------------------------------------------------------------------------
// Group selection
// ---------------------------------------------------------------------------

/// The highest-priority *group* present in `lanes`.
///
/// Transition and retry lanes are returned as the whole pending subset of
/// their family so that they render together.
#[must_use]
pub fn get_highest_priority_lanes(lanes: Lanes) -> Lanes {
    let lane = lanes.highest_priority_lane();
    if lane.includes_some(Lanes::TRANSITIONS) {
        return lanes & Lanes::TRANSITIONS;
    }
    if lane.includes_some(Lanes::RETRIES) {
        return lanes & Lanes::RETRIES;
    }
    if lane.is_empty() {
        return Lanes::NONE;
    }
    lane
}

/// Expiration windows applied by [`RootLanes::mark_starved_lanes_as_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationWindows {
    /// Window for sync and input-continuous lanes.
    pub sync_ms: Timestamp,
    /// Window for default and transition lanes.
    pub transition_ms: Timestamp,
}

impl Default for ExpirationWindows {
    fn default() -> Self {
        Self {
            sync_ms: 250,
            transition_ms: 5000,
        }
    }
}

/// Absolute expiry time for `lane` scheduled at `now`.
#[must_use]
pub fn compute_expiration_time(lane: Lane, now: Timestamp, windows: &ExpirationWindows) -> Timestamp {
    if lane == Lanes::SYNC
        || lane == Lanes::INPUT_CONTINUOUS_HYDRATION
        || lane == Lanes::INPUT_CONTINUOUS
    {
        return now + windows.sync_ms;
    }
    if lane == Lanes::DEFAULT_HYDRATION
        || lane == Lanes::DEFAULT
        || lane == Lanes::TRANSITION_HYDRATION
        || lane.includes_some(Lanes::TRANSITIONS)
    {
        return now + windows.transition_ms;
    }
    // Retry, idle and offscreen lanes never expire.
    NO_TIMESTAMP
}

// ---------------------------------------------------------------------------
// Lane allocation
// ---------------------------------------------------------------------------

/// Round-robin allocator for transition and retry lanes.
#[derive(Debug)]
pub struct LaneAllocator {
    next_transition: Cell<u32>,
    next_retry: Cell<u32>,
}

impl Default for LaneAllocator {
    fn default() -> Self {
        Self {
            next_transition: Cell::new(Lanes::TRANSITION_1.0),
            next_retry: Cell::new(Lanes::RETRY_1.0),
        }
    }
}

impl LaneAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next transition lane, wrapping after the sixteenth.
    pub fn claim_next_transition_lane(&self) -> Lane {
        let lane = self.next_transition.get();
        let mut next = lane << 1;
        if next & Lanes::TRANSITIONS.0 == 0 {
            next = Lanes::TRANSITION_1.0;
        }
        self.next_transition.set(next);
        Lanes(lane)
    }

    /// Claim the next retry lane, wrapping after the fifth.
    pub fn claim_next_retry_lane(&self) -> Lane {
        let lane = self.next_retry.get();
        let mut next = lane << 1;
        if next & Lanes::RETRIES.0 == 0 {
            next = Lanes::RETRY_1.0;
        }
        self.next_retry.set(next);
        Lanes(lane)
    }
}

// ---------------------------------------------------------------------------
// Root bookkeeping
// ---------------------------------------------------------------------------

/// Per-root lane bookkeeping.
#[derive(Clone, PartialEq, Eq)]
pub struct RootLanes {
    pub pending: Lanes,
    pub suspended: Lanes,
    pub pinged: Lanes,
    pub expired: Lanes,
    pub finished: Lanes,
    pub entangled: Lanes,
    pub entanglements: [Lanes; TOTAL_LANES],
    pub event_times: [Timestamp; TOTAL_LANES],
    pub expiration_times: [Timestamp; TOTAL_LANES],
}

impl Default for RootLanes {
    fn default() -> Self {
        Self {
            pending: Lanes::NONE,
            suspended: Lanes::NONE,
            pinged: Lanes::NONE,
            expired: Lanes::NONE,
            finished: Lanes::NONE,
            entangled: Lanes::NONE,
            entanglements: [Lanes::NONE; TOTAL_LANES],
            event_times: [NO_TIMESTAMP; TOTAL_LANES],
            expiration_times: [NO_TIMESTAMP; TOTAL_LANES],
        }
    }
}

impl fmt::Debug for RootLanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootLanes")
            .field("pending", &self.pending)
            .field("suspended", &self.suspended)
            .field("pinged", &self.pinged)
            .field("expired", &self.expired)
            .field("entangled", &self.entangled)
            .finish_non_exhaustive()
    }
}

impl RootLanes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the lanes to render next.
    ///
    /// Unsuspended non-idle work wins over pinged work, which wins over idle
    /// work. When a render is already in progress on `wip_lanes`, it is kept
    /// unless the candidate is strictly higher priority (a default update
    /// does not interrupt an in-flight transition).
    #[must_use]
    pub fn get_next_lanes(&self, wip_lanes: Lanes) -> Lanes {
        let pending = self.pending;
        if pending.is_empty() {
            return Lanes::NONE;
        }

        let mut next = Lanes::NONE;
        let non_idle_pending = pending & Lanes::NON_IDLE;
        if !non_idle_pending.is_empty() {
            let unblocked = non_idle_pending.remove(self.suspended);
            if !unblocked.is_empty() {
                next = get_highest_priority_lanes(unblocked);
            } else {
                let pinged = non_idle_pending & self.pinged;
                if !pinged.is_empty() {
                    next = get_highest_priority_lanes(pinged);
                }
            }
        } else {
            let unblocked = pending.remove(self.suspended);
            if !unblocked.is_empty() {
                next = get_highest_priority_lanes(unblocked);
            } else if !self.pinged.is_empty() {
                next = get_highest_priority_lanes(self.pinged);
            }
        }

        if next.is_empty() {
            return Lanes::NONE;
        }

        if !wip_lanes.is_empty() && wip_lanes != next && !wip_lanes.includes_some(self.suspended) {
            let next_lane = next.highest_priority_lane();
            let wip_lane = wip_lanes.highest_priority_lane();
            if next_lane.0 >= wip_lane.0
                || (next_lane == Lanes::DEFAULT && wip_lane.includes_some(Lanes::TRANSITIONS))
            {
                return wip_lanes;
            }
        }

        if next.includes_some(Lanes::INPUT_CONTINUOUS) {
            // Input-continuous and default updates are batched together.
            next |= pending & Lanes::DEFAULT;
        }

        if !self.entangled.is_empty() {
            for (index, _) in next & self.entangled {
                next |= self.entanglements[index];
            }
        }

        next
    }

    /// Stamp unstamped pending lanes with an expiry and move overdue lanes
    /// into `expired`.
    pub fn mark_starved_lanes_as_expired(&mut self, now: Timestamp, windows: &ExpirationWindows) {
        for (index, lane) in self.pending {
            let expiration = self.expiration_times[index];
            if expiration == NO_TIMESTAMP {
                if !lane.includes_some(self.suspended) || lane.includes_some(self.pinged) {
                    self.expiration_times[index] = compute_expiration_time(lane, now, windows);
                }
            } else if expiration <= now {
                self.expired |= lane;
            }
        }
    }

    /// True if any of `lanes` has expired on this root.
    #[must_use]
    pub fn includes_expired_lane(&self, lanes: Lanes) -> bool {
        lanes.includes_some(self.expired)
    }

    /// Most recent event time across `lanes`.
    #[must_use]
    pub fn most_recent_event_time(&self, lanes: Lanes) -> Timestamp {
        lanes
            .iter()
            .map(|(index, _)| self.event_times[index])
            .max()
            .unwrap_or(NO_TIMESTAMP)
    }

    pub fn mark_root_updated(&mut self, lane: Lane, event_time: Timestamp) {
        self.pending |= lane;
        // An update may unblock suspended work; idle updates are excluded
        // so they cannot starve the suspended lanes.
        if lane != Lanes::IDLE {
            self.suspended = Lanes::NONE;
            self.pinged = Lanes::NONE;
        }
        if !lane.is_empty() {
            self.event_times[lane.pick_arbitrary_lane_index()] = event_time;
        }
    }

    pub fn mark_root_suspended(&mut self, suspended: Lanes) {
        self.suspended |= suspended;
        self.pinged = self.pinged.remove(suspended);
        for (index, _) in suspended {
            self.expiration_times[index] = NO_TIMESTAMP;
        }
    }

    pub fn mark_root_pinged(&mut self, pinged: Lanes) {
        self.pinged |= self.suspended & pinged;
    }

    /// Clear everything not in `remaining` after a commit.
    pub fn mark_root_finished(&mut self, remaining: Lanes) {
        let no_longer_pending = self.pending.remove(remaining);
        self.pending = remaining;
        self.suspended = Lanes::NONE;
        self.pinged = Lanes::NONE;
        self.expired &= remaining;
        self.entangled &= remaining;
        for (index, _) in no_longer_pending {
            self.entanglements[index] = Lanes::NONE;
            self.event_times[index] = NO_TIMESTAMP;
            self.expiration_times[index] = NO_TIMESTAMP;
        }
    }

    /// Entangle `lanes` so future selections include all of them.
    pub fn mark_root_entangled(&mut self, lanes: Lanes) {
        self.entangled |= lanes;
        for (index, lane) in self.entangled {
            if lane.includes_some(lanes) || self.entanglements[index].includes_some(lanes) {
                self.entanglements[index] |= lanes;
            }
        }
    }

    /// Lanes worth retrying synchronously after a concurrent render errored.
    #[must_use]
    pub fn lanes_to_retry_synchronously_on_error(&self) -> Lanes {
        let everything_but_offscreen = self.pending.remove(Lanes::OFFSCREEN);
        if !everything_but_offscreen.is_empty() {
            return everything_but_offscreen;
        }
        if self.pending.includes_some(Lanes::OFFSCREEN) {
            return Lanes::OFFSCREEN;
        }
        Lanes::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_lane_is_lowest_bit() {
        let set = Lanes::DEFAULT | Lanes::SYNC | Lanes::IDLE;
        assert_eq!(set.highest_priority_lane(), Lanes::SYNC);
        assert_eq!(Lanes::NONE.highest_priority_lane(), Lanes::NONE);
    }

    #[test]
    fn transition_group_is_returned_whole() {
        let t1 = Lanes::TRANSITION_1;
        let t2 = Lanes::from_bits(t1.bits() << 1);
        let set = t1 | t2 | Lanes::IDLE;
        assert_eq!(get_highest_priority_lanes(set), t1 | t2);
    }

    #[test]
    fn transition_lanes_wrap_after_sixteen() {
        let alloc = LaneAllocator::new();
        let first = alloc.claim_next_transition_lane();
        for _ in 0..15 {
            assert!(alloc.claim_next_transition_lane().is_transition_lane());
        }
        assert_eq!(alloc.claim_next_transition_lane(), first);
    }

    #[test]
    fn retry_lanes_wrap_after_five() {
        let alloc = LaneAllocator::new();
        let first = alloc.claim_next_retry_lane();
        for _ in 0..4 {
            alloc.claim_next_retry_lane();
        }
        assert_eq!(alloc.claim_next_retry_lane(), first);
    }

    #[test]
    fn sync_beats_pending_transition() {
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::TRANSITION_1, 0);
        root.mark_root_updated(Lanes::SYNC, 1);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::SYNC);
    }

    #[test]
    fn in_progress_transition_is_not_interrupted_by_default() {
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::TRANSITION_1, 0);
        root.mark_root_updated(Lanes::DEFAULT, 1);
        assert_eq!(root.get_next_lanes(Lanes::TRANSITION_1), Lanes::TRANSITION_1);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::DEFAULT);
    }

    #[test]
    fn higher_priority_interrupts_in_progress_work() {
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::DEFAULT, 0);
        root.mark_root_updated(Lanes::INPUT_CONTINUOUS, 0);
        let next = root.get_next_lanes(Lanes::DEFAULT);
        assert!(next.includes_some(Lanes::INPUT_CONTINUOUS));
        // Default is folded into the continuous batch.
        assert!(next.includes_some(Lanes::DEFAULT));
    }

    #[test]
    fn suspended_lanes_are_skipped_until_pinged() {
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::DEFAULT, 0);
        root.mark_root_suspended(Lanes::DEFAULT);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::NONE);
        root.mark_root_pinged(Lanes::DEFAULT);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::DEFAULT);
    }

    #[test]
    fn pinging_unsuspended_lane_is_ignored() {
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::DEFAULT, 0);
        root.mark_root_pinged(Lanes::DEFAULT);
        assert_eq!(root.pinged, Lanes::NONE);
    }

    #[test]
    fn starved_lane_expires_after_window() {
        let windows = ExpirationWindows::default();
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::DEFAULT, 0);
        root.mark_starved_lanes_as_expired(0, &windows);
        assert!(!root.includes_expired_lane(Lanes::DEFAULT));
        root.mark_starved_lanes_as_expired(4999, &windows);
        assert!(!root.includes_expired_lane(Lanes::DEFAULT));
        root.mark_starved_lanes_as_expired(5000, &windows);
        assert!(root.includes_expired_lane(Lanes::DEFAULT));
    }

    #[test]
    fn retry_lanes_never_expire() {
        let windows = ExpirationWindows::default();
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::RETRY_1, 0);
        root.mark_starved_lanes_as_expired(0, &windows);
        root.mark_starved_lanes_as_expired(1_000_000, &windows);
        assert_eq!(root.expired, Lanes::NONE);
    }

    #[test]
    fn finished_clears_bookkeeping_for_committed_lanes() {
        let windows = ExpirationWindows::default();
        let mut root = RootLanes::new();
        root.mark_root_updated(Lanes::DEFAULT, 10);
        root.mark_root_updated(Lanes::TRANSITION_1, 20);
        root.mark_starved_lanes_as_expired(10, &windows);
        root.mark_root_finished(Lanes::TRANSITION_1);
        assert_eq!(root.pending, Lanes::TRANSITION_1);
        let idx = Lanes::DEFAULT.pick_arbitrary_lane_index();
        assert_eq!(root.event_times[idx], NO_TIMESTAMP);
        assert_eq!(root.expiration_times[idx], NO_TIMESTAMP);
    }

    #[test]
    fn entangled_lanes_are_selected_together() {
        let mut root = RootLanes::new();
        let t1 = Lanes::TRANSITION_1;
        root.mark_root_updated(Lanes::DEFAULT, 0);
        root.mark_root_updated(t1, 0);
        root.mark_root_entangled(Lanes::DEFAULT | t1);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::DEFAULT | t1);
    }

    #[test]
    fn display_groups_families() {
        let t2 = Lanes::from_bits(Lanes::TRANSITION_1.bits() << 1);
        let set = Lanes::SYNC | Lanes::TRANSITION_1 | t2;
        assert_eq!(set.to_string(), "sync|transition");
    }

    #[test]
    fn not_stays_within_lane_bits() {
        assert_eq!((!Lanes::NONE).bits(), ALL_BITS);
    }
}
