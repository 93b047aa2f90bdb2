//! Allocation coordinator: the phase operations the host pipeline calls
//! for every scheduling attempt of a workload that uses resource claims.
//!
//! # Phase order
//!
//! ```text
//! PreEnqueue ─► PreFilter ─► Filter (per node) ─┬─► PreScore ─► Reserve ─► PreBind ─► PostBind
//!                                               └─► PostFilter (no node fits)
//!                                    Unreserve ◄── any failure after Reserve
//! ```
//!
//! Phases of one attempt run sequentially and share one [`CycleState`].
//! Different attempts run concurrently and share the claim assume cache
//! and the in-flight table owned by the [`ClaimCoordinator`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use claimgrid_allocator::{Allocator, AllocatorError, allocation_available_on};
use claimgrid_state::{
    AllocationResult, DeviceClass, DeviceId, Node, ObjectKey, ResourceClaim, ResourceSlice,
    StateStore, StoredObject, Workload,
};

use crate::assume_cache::AssumeCache;
use crate::config::CoordinatorConfig;
use crate::cycle_state::{ClaimEntry, CycleState};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::handshake::HandshakeState;
use crate::in_flight::{InFlightAllocations, InFlightConflict};
use crate::resolve::resolve_claims;
use crate::status::Status;

/// Shared coordinator state, constructed once per scheduler process.
pub struct ClaimCoordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) store: StateStore,
    pub(crate) claims: Arc<AssumeCache<ResourceClaim>>,
    pub(crate) in_flight: InFlightAllocations,
}

impl ClaimCoordinator {
    /// Build a coordinator over `store`. The claim cache subscribes to the
    /// store and is populated from it before this returns.
    pub fn new(config: CoordinatorConfig, store: StateStore) -> CoordinatorResult<Self> {
        config.validate()?;
        let claims = AssumeCache::new(&store)?;
        info!(
            enabled = config.enabled,
            control_plane_controller = config.control_plane_controller,
            claims = claims.len(),
            "claim coordinator started"
        );
        Ok(Self {
            config,
            store,
            claims,
            in_flight: InFlightAllocations::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn claim_cache(&self) -> &AssumeCache<ResourceClaim> {
        &self.claims
    }

    pub fn in_flight(&self) -> &InFlightAllocations {
        &self.in_flight
    }

    pub(crate) fn resolve(&self, workload: &Workload) -> Result<Vec<ClaimEntry>, String> {
        resolve_claims(workload, |key| self.claims.get(key))
    }

    /// Devices referenced by any known allocation, stored, assumed or in flight.
    fn devices_in_use(&self) -> HashSet<DeviceId> {
        let claims = self.claims.list();
        let mut devices: HashSet<DeviceId> =
            claims.iter().flat_map(|c| c.allocated_devices()).collect();
        devices.extend(self.in_flight.devices());
        devices
    }

    // ── PreEnqueue ─────────────────────────────────────────────────

    /// Admission check before the workload enters the scheduling queue.
    pub fn pre_enqueue(&self, workload: &Workload) -> Status {
        if !self.config.enabled_for(&workload.namespace) {
            return Status::success();
        }
        match self.resolve(workload) {
            Ok(_) => Status::success(),
            Err(reason) => {
                debug!(workload = %workload.key(), %reason, "workload not ready for scheduling");
                Status::unresolvable(reason)
            }
        }
    }

    // ── PreFilter ──────────────────────────────────────────────────

    pub fn pre_filter(&self, state: &mut CycleState, workload: &Workload) -> Status {
        let workload_key = workload.key();
        if !self.config.enabled_for(&workload.namespace) {
            debug!(workload = %workload_key, "claim coordination disabled");
            return Status::skip();
        }

        let claims = match self.resolve(workload) {
            Ok(claims) => claims,
            Err(reason) => return Status::unresolvable(reason),
        };
        if claims.is_empty() {
            return Status::skip();
        }

        let classes: BTreeMap<String, DeviceClass> = match self.store.list::<DeviceClass>() {
            Ok(list) => list.into_iter().map(|c| (c.meta.name.clone(), c)).collect(),
            Err(e) => return CoordinatorError::from(e).into(),
        };

        let mut structured = Vec::new();
        let mut uses_controller = false;
        for (index, entry) in claims.iter().enumerate() {
            let claim = &entry.claim;
            uses_controller |= claim.uses_control_plane();
            if claim.status.deallocation_requested {
                return Status::unresolvable("resourceclaim must be reallocated");
            }
            // An in-flight allocation is already visible through the cache.
            if self.in_flight.contains(&claim.meta.uid) {
                let err = CoordinatorError::AllocationInFlight { key: claim.key() };
                return Status::unresolvable(err.to_string());
            }
            if claim.is_allocated() {
                if !claim.is_reserved_for(workload)
                    && !claim.can_be_reserved(self.config.max_reserved_for)
                {
                    return Status::unresolvable("resourceclaim in use");
                }
                continue;
            }

            if claim.uses_control_plane() {
                if !self.config.control_plane_controller {
                    return Status::unresolvable(
                        "resourceclaim has a control plane controller, but support is disabled",
                    );
                }
            } else {
                structured.push(index);
            }

            if let Some(request) = claim
                .spec
                .requests
                .iter()
                .find(|r| !classes.contains_key(&r.device_class_name))
            {
                let err = AllocatorError::MissingClass {
                    request: request.name.clone(),
                    class: request.device_class_name.clone(),
                };
                return Status::unresolvable(err.to_string());
            }
        }

        if uses_controller && self.config.control_plane_controller {
            match HandshakeState::load(&self.store, workload) {
                Ok(handshake) => state.handshake = handshake,
                Err(e) => return e.into(),
            }
        }

        if !structured.is_empty() {
            let pending: Vec<ResourceClaim> =
                structured.iter().map(|&i| claims[i].claim.clone()).collect();
            match Allocator::new(&pending, &classes, self.devices_in_use()) {
                Ok(allocator) => state.allocator = Some(allocator),
                Err(e @ AllocatorError::Compile { .. }) => {
                    warn!(workload = %workload_key, error = %e, "selector does not compile");
                    state.setup_error = Some(e.to_string());
                }
                Err(e) => return Status::unresolvable(e.to_string()),
            }
            state.slices = match self.store.list::<ResourceSlice>() {
                Ok(slices) => slices,
                Err(e) => return CoordinatorError::from(e).into(),
            };
        }

        debug!(
            workload = %workload_key,
            claims = claims.len(),
            structured = structured.len(),
            "claims prepared"
        );
        state.claims = claims;
        state.structured = structured;
        state.initialized = true;
        Status::success()
    }

    // ── Filter ─────────────────────────────────────────────────────

    /// Check whether the workload's claims can be satisfied on `node`.
    ///
    /// Read-only with respect to shared state; safe to call concurrently
    /// for many nodes of the same attempt.
    pub fn filter(
        &self,
        cancel: &CancellationToken,
        state: &CycleState,
        workload: &Workload,
        node: &Node,
    ) -> Status {
        if cancel.is_cancelled() {
            return CoordinatorError::Cancelled.into();
        }
        if !state.initialized {
            return CoordinatorError::MissingCycleState.into();
        }
        if let Some(message) = &state.setup_error {
            return Status::error(message.clone());
        }

        let mut unavailable = Vec::new();
        for (index, entry) in state.claims.iter().enumerate() {
            let claim = &entry.claim;
            match &claim.status.allocation {
                Some(allocation) => {
                    if !allocation_available_on(allocation.node_selector.as_ref(), node) {
                        unavailable.push(index);
                    }
                }
                None if claim.uses_control_plane() => {
                    if state.handshake.is_unsuitable(&entry.slot, &node.name) {
                        debug!(
                            workload = %workload.key(),
                            claim = %claim.key(),
                            node = %node.name,
                            "node unsuitable for claim"
                        );
                        return Status::unresolvable(
                            "resourceclaim cannot be allocated for the node (unsuitable)",
                        );
                    }
                }
                None => {}
            }
        }
        if !unavailable.is_empty() {
            for index in unavailable {
                state.record_unavailable(index);
            }
            return Status::unresolvable("resourceclaim not available on the node");
        }

        if let Some(allocator) = &state.allocator {
            match allocator.allocate(node, &state.slices) {
                Ok(Some(_)) => {}
                Ok(None) => return Status::unresolvable("cannot allocate all claims"),
                Err(e) if e.is_runtime() => {
                    let message = e.to_string();
                    debug!(
                        workload = %workload.key(),
                        node = %node.name,
                        error = %message,
                        "selector runtime error"
                    );
                    state.record_runtime_error(&node.name, &message);
                    return Status::unresolvable(message);
                }
                Err(e) => return Status::error(e.to_string()),
            }
        }
        Status::success()
    }

    // ── PostFilter ─────────────────────────────────────────────────

    /// Called when no node passed Filter. Deallocates claims whose
    /// allocation pinned the workload to nodes it cannot use.
    pub fn post_filter(&self, state: &CycleState, workload: &Workload) -> Status {
        let unavailable = state.unavailable();
        if state.claims.is_empty() || unavailable.is_empty() {
            return Status::unschedulable("no new claims to deallocate");
        }

        let mut deallocated = false;
        for index in unavailable {
            let claim = &state.claims[index].claim;
            let reserved = &claim.status.reserved_for;
            if !(reserved.is_empty() || (reserved.len() == 1 && claim.is_reserved_for(workload))) {
                continue;
            }

            let mut updated = claim.clone();
            updated.status.reserved_for.clear();
            if claim.is_allocated_with_structured_parameters() {
                updated.status.allocation = None;
                updated.meta.finalizers.retain(|f| f != &self.config.finalizer);
            } else {
                updated.status.deallocation_requested = true;
            }
            if let Err(e) = self.store.update(&updated) {
                return CoordinatorError::from(e).into();
            }
            info!(workload = %workload.key(), claim = %claim.key(), "claim deallocated");
            deallocated = true;
        }

        if deallocated {
            Status::unschedulable("deallocation of ResourceClaim completed")
        } else {
            Status::unschedulable("no new claims to deallocate")
        }
    }

    // ── PreScore ───────────────────────────────────────────────────

    /// Called with the nodes that passed Filter when there is more than one.
    pub fn pre_score(
        &self,
        cancel: &CancellationToken,
        state: &mut CycleState,
        workload: &Workload,
        nodes: &[Node],
    ) -> Status {
        if cancel.is_cancelled() {
            return CoordinatorError::Cancelled.into();
        }
        if !state.initialized {
            return CoordinatorError::MissingCycleState.into();
        }
        state.prescored = true;

        if let Some((node, message)) = state.first_runtime_error() {
            return Status::unresolvable(format!("filter node {node}: {message}"));
        }

        if state.pending_delegated().next().is_none() {
            return Status::success();
        }

        let mut potential: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        potential.sort();
        potential.dedup();
        potential.truncate(self.config.max_potential_nodes);
        if state
            .handshake
            .lists_all_potential_nodes(potential.iter().map(String::as_str))
        {
            return Status::success();
        }
        debug!(
            workload = %workload.key(),
            nodes = potential.len(),
            "requesting information about potential nodes"
        );
        state.handshake.request_potential_nodes(potential);
        Status::success()
    }

    // ── Reserve ────────────────────────────────────────────────────

    /// Allocate unallocated structured claims on `node`, record them in
    /// flight and assume them. Prepare the handshake for delegated ones.
    pub fn reserve(&self, state: &mut CycleState, workload: &Workload, node: &Node) -> Status {
        if !state.initialized {
            return CoordinatorError::MissingCycleState.into();
        }
        let workload_key = workload.key();

        if !state.structured.is_empty() {
            if let Some(message) = &state.setup_error {
                return Status::error(message.clone());
            }
            let in_use = self.devices_in_use();
            let Some(allocator) = state.allocator.as_mut() else {
                return CoordinatorError::MissingCycleState.into();
            };
            allocator.exclude(in_use);
            let results = match allocator.allocate(node, &state.slices) {
                Ok(Some(results)) => results,
                Ok(None) => {
                    return Status::error(format!(
                        "claims of workload {workload_key} cannot be allocated on node {} any more",
                        node.name
                    ));
                }
                Err(e) => return Status::error(e.to_string()),
            };

            let mut recorded = Vec::with_capacity(results.len());
            for (&index, allocation) in state.structured.iter().zip(results) {
                let claim = &state.claims[index].claim;
                let key = claim.key();
                if let Err(e) = self.record_in_flight(claim, &allocation) {
                    warn!(
                        workload = %workload_key,
                        claim = %key,
                        error = %e,
                        "reserve lost a race"
                    );
                    self.release(&state.claims, &recorded);
                    for index in &recorded {
                        state.allocations.remove(index);
                    }
                    return e.into();
                }
                info!(
                    workload = %workload_key,
                    claim = %key,
                    node = %node.name,
                    devices = allocation.devices.len(),
                    "claim allocated"
                );
                recorded.push(index);
                state.allocations.insert(index, allocation);
            }
        }

        let pending: Vec<usize> = state.pending_delegated().collect();
        if pending.is_empty() {
            return Status::success();
        }

        if !state.prescored && !state.handshake.lists_potential_node(&node.name) {
            state.handshake.request_potential_nodes(vec![node.name.clone()]);
        }

        let with_status = pending
            .iter()
            .filter(|&&i| state.handshake.has_status_for(&state.claims[i].slot))
            .count();
        let can_select =
            (pending.len() == 1 && state.structured.is_empty()) || with_status == pending.len();
        if can_select && state.handshake.stored_selected_node() != Some(node.name.as_str()) {
            info!(
                workload = %workload_key,
                node = %node.name,
                "selecting node for delegated allocation"
            );
            state.handshake.select_node(&node.name);
            return Status::success();
        }

        if state.handshake.is_dirty() {
            return Status::success();
        }
        Status::pending("waiting for resource driver to provide information")
    }

    /// Claim the allocation's devices in the in-flight table, then make it
    /// visible through the claim cache.
    fn record_in_flight(
        &self,
        claim: &ResourceClaim,
        allocation: &AllocationResult,
    ) -> CoordinatorResult<()> {
        let key = claim.key();
        match self
            .in_flight
            .try_insert(&claim.meta.uid, key.clone(), allocation.clone())
        {
            Ok(()) => {}
            Err(InFlightConflict::Claim) => {
                return Err(CoordinatorError::AllocationInFlight { key });
            }
            Err(InFlightConflict::Device { device, holder }) => {
                return Err(CoordinatorError::DeviceInFlight {
                    key,
                    device,
                    holder,
                });
            }
        }
        // A claim bound since `devices_in_use` left the table before this
        // insert but is already in the cache.
        let wanted: HashSet<DeviceId> = allocation.devices.iter().map(|d| d.device_id()).collect();
        for other in self.claims.list() {
            if other.meta.uid == claim.meta.uid {
                continue;
            }
            if let Some(device) = other.allocated_devices().find(|d| wanted.contains(d)) {
                self.in_flight.remove(&claim.meta.uid);
                return Err(CoordinatorError::DeviceAllocated {
                    key,
                    device,
                    holder: other.key(),
                });
            }
        }

        let mut assumed = claim.clone();
        assumed.status.allocation = Some(allocation.clone());
        if let Err(e) = self.claims.assume(assumed) {
            self.in_flight.remove(&claim.meta.uid);
            return Err(e);
        }
        Ok(())
    }

    /// Drop the in-flight entries and cache overlays of `indices`.
    fn release(&self, claims: &[ClaimEntry], indices: &[usize]) {
        for &index in indices {
            let claim = &claims[index].claim;
            self.in_flight.remove(&claim.meta.uid);
            self.claims.forget(&claim.key());
        }
    }

    // ── Unreserve ──────────────────────────────────────────────────

    /// Roll back Reserve and, after a failed bind, PreBind's reservations.
    /// Idempotent. Failures are logged, never returned.
    pub fn unreserve(&self, state: &mut CycleState, workload: &Workload, node: &Node) -> Status {
        let workload_key = workload.key();

        if state.handshake.is_dirty() {
            if let Err(e) = state.handshake.publish(&self.store, workload) {
                warn!(
                    workload = %workload_key,
                    error = %e,
                    "publishing control plane context failed"
                );
            }
        }

        let allocated: Vec<usize> = std::mem::take(&mut state.allocations).into_keys().collect();
        self.release(&state.claims, &allocated);

        for entry in &mut state.claims {
            if !entry.claim.is_allocated() || !entry.claim.is_reserved_for(workload) {
                continue;
            }
            let key = entry.claim.key();
            match self.remove_reservation(&key, workload) {
                Ok(Some(updated)) => {
                    info!(
                        workload = %workload_key,
                        claim = %key,
                        node = %node.name,
                        "reservation removed"
                    );
                    entry.claim = updated;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        workload = %workload_key,
                        claim = %key,
                        error = %e,
                        "removing reservation failed"
                    );
                }
            }
        }
        Status::success()
    }

    fn remove_reservation(
        &self,
        key: &ObjectKey,
        workload: &Workload,
    ) -> CoordinatorResult<Option<ResourceClaim>> {
        let Some(mut claim) = self.store.get::<ResourceClaim>(key)? else {
            return Ok(None);
        };
        let before = claim.status.reserved_for.len();
        claim.status.reserved_for.retain(|r| r.uid != workload.uid);
        if claim.status.reserved_for.len() == before {
            return Ok(None);
        }
        Ok(Some(self.store.update(&claim)?))
    }

    // ── PreBind ────────────────────────────────────────────────────

    /// Durably reserve every claim for the workload, or publish the
    /// handshake and wait for the delegated controllers.
    pub fn pre_bind(
        &self,
        cancel: &CancellationToken,
        state: &mut CycleState,
        workload: &Workload,
        node: &Node,
    ) -> Status {
        if cancel.is_cancelled() {
            return CoordinatorError::Cancelled.into();
        }
        if !state.initialized {
            return CoordinatorError::MissingCycleState.into();
        }

        if state.handshake.is_dirty() {
            if let Err(e) = state.handshake.publish(&self.store, workload) {
                return e.into();
            }
            return Status::pending("waiting for resource driver");
        }
        if state.pending_delegated().next().is_some() {
            return Status::pending("waiting for resource driver");
        }

        for index in 0..state.claims.len() {
            if state.claims[index].claim.is_reserved_for(workload) {
                continue;
            }
            match self.bind_claim(state, index, workload) {
                Ok(written) => state.claims[index].claim = written,
                Err(e) => {
                    warn!(
                        workload = %workload.key(),
                        node = %node.name,
                        error = %e,
                        "binding claim failed"
                    );
                    return e.into();
                }
            }
        }
        Status::success()
    }

    /// One compare-and-swap write adding the finalizer, the allocation
    /// computed by Reserve (if any) and the reservation.
    fn bind_claim(
        &self,
        state: &CycleState,
        index: usize,
        workload: &Workload,
    ) -> CoordinatorResult<ResourceClaim> {
        let mut claim = state.claims[index].claim.clone();
        let key = claim.key();
        let allocation = state.allocations.get(&index);
        if let Some(allocation) = allocation {
            claim.meta.add_finalizer(&self.config.finalizer);
            claim.status.allocation = Some(allocation.clone());
        }
        claim.status.reserved_for.push(workload.as_consumer());

        let result = self.store.update(&claim);
        if allocation.is_some() {
            self.in_flight.remove(&claim.meta.uid);
        }
        let written = result?;
        if let Err(e) = self.claims.assume(written.clone()) {
            debug!(claim = %key, error = %e, "assuming written claim skipped");
        }
        info!(
            workload = %workload.key(),
            claim = %key,
            version = %written.meta.version,
            "claim reserved"
        );
        Ok(written)
    }

    // ── PostBind ───────────────────────────────────────────────────

    /// Clean up after a successful bind.
    pub fn post_bind(&self, state: &mut CycleState, workload: &Workload, node: &Node) -> Status {
        let allocated: Vec<usize> = std::mem::take(&mut state.allocations).into_keys().collect();
        self.release(&state.claims, &allocated);

        if state.handshake.context().is_some() {
            if let Err(e) = HandshakeState::delete(&self.store, workload) {
                warn!(
                    workload = %workload.key(),
                    node = %node.name,
                    error = %e,
                    "deleting control plane context failed"
                );
            }
        }
        Status::success()
    }
}
