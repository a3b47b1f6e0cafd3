#![forbid(unsafe_code)]

//! Passive effects: the deferred half of a commit.
//!
//! After a commit that produced passive work the reconciler remembers the
//! finished tree in [`PendingPassive`] and asks the scheduler for a
//! [`Task::FlushPassiveEffects`](fibra_core::Task). The flush runs every
//! passive destroy before any passive create, and releases deleted
//! subtrees from the arena once their cleanups ran.
//!
//! Any render or commit flushes outstanding passive effects first, so
//! effects never observe a tree two commits old.

use fibra_core::{FiberId, Flags, HookFlags, HostConfig, Lanes, ReconcilerError, RootId};

use crate::fiber::FiberKind;
use crate::reconciler::Reconciler;
use crate::shared::ExecutionContext;

/// A committed tree whose passive effects have not run yet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingPassive {
    pub(crate) root: RootId,
    pub(crate) finished: FiberId,
    pub(crate) lanes: Lanes,
}

fn has_hooks(kind: &FiberKind) -> bool {
    matches!(kind, FiberKind::Function(_) | FiberKind::Memo(_) | FiberKind::Lazy(_))
}

impl<H: HostConfig> Reconciler<H> {
    /// Run pending passive effects; returns `false` if there were none.
    pub(crate) fn flush_passive_effects_impl(&mut self) -> Result<bool, ReconcilerError> {
        let Some(pending) = self.pending_passive.take() else {
            return Ok(false);
        };
        if self.shared.is_working() {
            // Called from inside a commit; the scheduled task picks it up.
            self.pending_passive = Some(pending);
            return Ok(false);
        }
        self.passive_scheduled = false;
        let span = tracing::debug_span!("fibra.passive", root = ?pending.root, lanes = %pending.lanes);
        let prev = self.shared.enter(ExecutionContext::COMMIT);
        span.in_scope(|| {
            self.commit_passive_unmount_effects(pending.finished);
            self.commit_passive_mount_effects(pending.finished);
        });
        self.shared.set_execution(prev);
        tracing::trace!(target: "fibra.passive", lanes = %pending.lanes, "flushed passive effects");

        self.drain_inbox()?;
        let updated = self
            .roots
            .get(pending.root)
            .is_some_and(|r| !r.lanes.pending.is_empty());
        if updated {
            if self.root_with_passive_nested_updates == Some(pending.root) {
                self.nested_passive_update_count += 1;
            } else {
                self.nested_passive_update_count = 0;
                self.root_with_passive_nested_updates = Some(pending.root);
            }
        } else {
            self.nested_passive_update_count = 0;
            self.root_with_passive_nested_updates = None;
        }
        self.flush_sync_callbacks()?;
        Ok(true)
    }

    fn passive_children(&self, fiber: FiberId) -> Vec<FiberId> {
        if self.fibers[fiber].subtree_flags.intersects(Flags::PASSIVE_MASK) {
            self.children_of(fiber)
        } else {
            Vec::new()
        }
    }

    fn commit_passive_unmount_effects(&mut self, fiber: FiberId) {
        if self.fibers[fiber].flags.contains(Flags::CHILD_DELETION) {
            let deletions = std::mem::take(&mut self.fibers[fiber].deletions);
            for deleted in deletions {
                self.passive_unmount_deleted_tree(deleted, fiber);
                self.detach_deleted_subtree(deleted);
            }
        }
        for child in self.passive_children(fiber) {
            self.commit_passive_unmount_effects(child);
        }
        let f = &self.fibers[fiber];
        if has_hooks(&f.kind) && f.flags.contains(Flags::PASSIVE) {
            let nearest = f.return_;
            self.commit_hook_unmounts(fiber, HookFlags::PASSIVE | HookFlags::HAS_EFFECT, nearest);
        }
    }

    /// Every passive cleanup in a deleted subtree, parents first.
    fn passive_unmount_deleted_tree(&mut self, deleted: FiberId, nearest: FiberId) {
        let mut stack = vec![deleted];
        while let Some(id) = stack.pop() {
            let Some(f) = self.fibers.get(id) else { continue };
            if has_hooks(&f.kind) {
                self.commit_hook_unmounts(id, HookFlags::PASSIVE, Some(nearest));
            }
            let mut children = self.children_of(id);
            children.reverse();
            stack.extend(children);
        }
    }

    fn commit_passive_mount_effects(&mut self, fiber: FiberId) {
        for child in self.passive_children(fiber) {
            self.commit_passive_mount_effects(child);
        }
        let f = &self.fibers[fiber];
        if has_hooks(&f.kind) && f.flags.contains(Flags::PASSIVE) {
            self.commit_hook_mounts(fiber, HookFlags::PASSIVE | HookFlags::HAS_EFFECT);
        }
    }
}
