#![forbid(unsafe_code)]

//! Effect flags, hook effect tags and fiber modes.
//!
//! Fiber flags record the host-visible side effects a completed fiber still
//! owes the commit pipeline. `subtree_flags` on a parent is the union of its
//! children's flags and subtree flags, so every phase can skip a subtree
//! whose mask does not intersect.

use bitflags::bitflags;

bitflags! {
    /// Side-effect flags carried by a fiber.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        const PERFORMED_WORK = 1 << 0;
        const PLACEMENT = 1 << 1;
        const UPDATE = 1 << 2;
        const CHILD_DELETION = 1 << 4;
        const CONTENT_RESET = 1 << 5;
        const CALLBACK = 1 << 6;
        const DID_CAPTURE = 1 << 7;
        const REF = 1 << 9;
        const SNAPSHOT = 1 << 10;
        const PASSIVE = 1 << 11;
        const VISIBILITY = 1 << 13;
        const STORE_CONSISTENCY = 1 << 14;

        /// Every flag below this bit is an effect a host can observe.
        const HOST_EFFECT_MASK = (1 << 15) - 1;

        const INCOMPLETE = 1 << 15;
        const SHOULD_CAPTURE = 1 << 16;

        // Static flags survive `create_work_in_progress`.
        const REF_STATIC = 1 << 21;
        const LAYOUT_STATIC = 1 << 22;
        const PASSIVE_STATIC = 1 << 23;

        const BEFORE_MUTATION_MASK = Self::UPDATE.bits() | Self::SNAPSHOT.bits();
        const MUTATION_MASK = Self::PLACEMENT.bits()
            | Self::UPDATE.bits()
            | Self::CHILD_DELETION.bits()
            | Self::CONTENT_RESET.bits()
            | Self::REF.bits()
            | Self::VISIBILITY.bits();
        const LAYOUT_MASK = Self::UPDATE.bits()
            | Self::CALLBACK.bits()
            | Self::REF.bits()
            | Self::VISIBILITY.bits();
        const PASSIVE_MASK = Self::PASSIVE.bits()
            | Self::VISIBILITY.bits()
            | Self::CHILD_DELETION.bits();
        const STATIC_MASK = Self::LAYOUT_STATIC.bits()
            | Self::PASSIVE_STATIC.bits()
            | Self::REF_STATIC.bits();
    }
}

bitflags! {
    /// Tags on a hook effect record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HookFlags: u8 {
        /// The effect must run in this commit.
        const HAS_EFFECT = 1 << 0;
        const INSERTION = 1 << 1;
        const LAYOUT = 1 << 2;
        const PASSIVE = 1 << 3;
    }
}

bitflags! {
    /// Rendering mode inherited from the root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mode: u8 {
        const CONCURRENT = 1 << 0;
        const PROFILE = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_are_disjoint_from_static_flags() {
        assert!(!Flags::MUTATION_MASK.intersects(Flags::STATIC_MASK));
        assert!(!Flags::HOST_EFFECT_MASK.intersects(Flags::INCOMPLETE));
        assert!(Flags::HOST_EFFECT_MASK.contains(Flags::DID_CAPTURE));
    }

    #[test]
    fn passive_mask_includes_deletions() {
        assert!(Flags::PASSIVE_MASK.contains(Flags::CHILD_DELETION));
        assert!(!Flags::LAYOUT_MASK.contains(Flags::PASSIVE));
    }
}
