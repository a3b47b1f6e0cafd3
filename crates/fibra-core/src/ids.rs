#![forbid(unsafe_code)]

//! Arena handles.
//!
//! Fibers, roots, host nodes and portal targets live in generational arenas;
//! these keys are the only way code outside the reconciler refers to them.

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a fiber in the reconciler arena.
    pub struct FiberId;
    /// Handle to a root container.
    pub struct RootId;
    /// Handle to a host instance or text instance, shared by both alternates.
    pub struct HostNodeId;
    /// Handle to a registered portal target container.
    pub struct PortalId;
}
