//! Per-attempt scheduling state.
//!
//! The host creates one [`CycleState`] per scheduling attempt of one
//! workload and passes it to every phase of that attempt. PreFilter fills
//! it; later phases read what PreFilter and Filter computed instead of
//! recomputing it. Filter runs concurrently for many nodes and therefore
//! only records into the `Mutex` fields.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use claimgrid_allocator::Allocator;
use claimgrid_state::{AllocationResult, ResourceClaim, ResourceSlice};

use crate::handshake::HandshakeState;

/// One resolved claim slot of the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEntry {
    /// Workload claim slot name.
    pub slot: String,
    pub claim: ResourceClaim,
}

#[derive(Debug, Default)]
pub struct CycleState {
    pub(crate) initialized: bool,
    pub(crate) claims: Vec<ClaimEntry>,
    /// Indexes into `claims` of unallocated claims the allocator handles,
    /// in the order the allocator sees them.
    pub(crate) structured: Vec<usize>,
    pub(crate) allocator: Option<Allocator>,
    /// Non-node-specific allocator setup failure, reported by Filter.
    pub(crate) setup_error: Option<String>,
    pub(crate) slices: Vec<ResourceSlice>,
    pub(crate) handshake: HandshakeState,
    /// Allocated claims found unusable on some node during Filter.
    pub(crate) unavailable_claims: Mutex<BTreeSet<usize>>,
    /// Selector runtime errors seen during Filter, by node.
    pub(crate) runtime_errors: Mutex<BTreeMap<String, String>>,
    pub(crate) prescored: bool,
    /// Allocations computed by Reserve, by claim index.
    pub(crate) allocations: BTreeMap<usize, AllocationResult>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims resolved by PreFilter.
    pub fn claims(&self) -> &[ClaimEntry] {
        &self.claims
    }

    /// Allocation Reserve computed for the claim at `index`.
    pub fn allocation(&self, index: usize) -> Option<&AllocationResult> {
        self.allocations.get(&index)
    }

    pub fn handshake(&self) -> &HandshakeState {
        &self.handshake
    }

    pub(crate) fn record_unavailable(&self, index: usize) {
        self.unavailable_claims
            .lock()
            .expect("cycle state lock")
            .insert(index);
    }

    pub(crate) fn unavailable(&self) -> BTreeSet<usize> {
        self.unavailable_claims.lock().expect("cycle state lock").clone()
    }

    pub(crate) fn record_runtime_error(&self, node: &str, message: &str) {
        self.runtime_errors
            .lock()
            .expect("cycle state lock")
            .insert(node.to_string(), message.to_string());
    }

    /// First node (by name) whose Filter hit a selector runtime error.
    pub(crate) fn first_runtime_error(&self) -> Option<(String, String)> {
        self.runtime_errors
            .lock()
            .expect("cycle state lock")
            .iter()
            .next()
            .map(|(node, message)| (node.clone(), message.clone()))
    }

    /// Indexes of unallocated claims delegated to a controller.
    pub(crate) fn pending_delegated(&self) -> impl Iterator<Item = usize> + '_ {
        self.claims
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.claim.is_allocated() && e.claim.uses_control_plane())
            .map(|(i, _)| i)
    }
}
