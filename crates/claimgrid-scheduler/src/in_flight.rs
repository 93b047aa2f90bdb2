//! In-flight allocations: claims Reserve has allocated but PreBind has
//! not yet persisted.
//!
//! Keyed by claim UID. At most one entry per claim exists at any time, and
//! no device appears in two entries; an insert violating either is refused.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use claimgrid_state::{AllocationResult, DeviceId, ObjectKey, Uid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    pub claim: ObjectKey,
    pub allocation: AllocationResult,
}

/// Why [`InFlightAllocations::try_insert`] refused an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InFlightConflict {
    /// The claim already has an allocation in flight.
    Claim,
    /// The device is part of another claim's in-flight allocation.
    Device { device: DeviceId, holder: ObjectKey },
}

#[derive(Debug, Default)]
pub struct InFlightAllocations {
    entries: RwLock<HashMap<Uid, InFlightEntry>>,
}

impl InFlightAllocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation for `uid` unless the claim or one of its
    /// devices is already in flight. On conflict the table is unchanged.
    pub fn try_insert(
        &self,
        uid: &str,
        claim: ObjectKey,
        allocation: AllocationResult,
    ) -> Result<(), InFlightConflict> {
        let mut entries = self.entries.write().expect("in-flight lock");
        if entries.contains_key(uid) {
            return Err(InFlightConflict::Claim);
        }
        for entry in entries.values() {
            for held in &entry.allocation.devices {
                if allocation.devices.iter().any(|d| d.device_id() == held.device_id()) {
                    return Err(InFlightConflict::Device {
                        device: held.device_id(),
                        holder: entry.claim.clone(),
                    });
                }
            }
        }
        debug!(%claim, devices = allocation.devices.len(), "allocation in flight");
        entries.insert(uid.to_string(), InFlightEntry { claim, allocation });
        Ok(())
    }

    pub fn get(&self, uid: &str) -> Option<InFlightEntry> {
        self.entries.read().expect("in-flight lock").get(uid).cloned()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.read().expect("in-flight lock").contains_key(uid)
    }

    pub fn remove(&self, uid: &str) -> Option<InFlightEntry> {
        let removed = self.entries.write().expect("in-flight lock").remove(uid);
        if let Some(entry) = &removed {
            debug!(claim = %entry.claim, "in-flight allocation cleared");
        }
        removed
    }

    /// Every device referenced by an in-flight allocation.
    pub fn devices(&self) -> HashSet<DeviceId> {
        let entries = self.entries.read().expect("in-flight lock");
        entries
            .values()
            .flat_map(|e| e.allocation.devices.iter().map(|d| d.device_id()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("in-flight lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole table, for comparisons in tests and reports.
    pub fn snapshot(&self) -> HashMap<Uid, InFlightEntry> {
        self.entries.read().expect("in-flight lock").clone()
    }
}
