//! Structured allocator: assigns devices from a node's inventory to the
//! requests of a set of claims.
//!
//! Preparation ([`Allocator::new`]) resolves device classes and compiles
//! every selector once. Allocation ([`Allocator::allocate`]) runs per node:
//!
//! 1. For each request, the candidate devices are those not already in use
//!    that pass every class selector and every request selector.
//! 2. Candidates are combined across all requests with a depth-first
//!    search. A device assigned to one request is unavailable to the rest.
//!    Devices and requests are visited in fixed order and the first
//!    complete assignment wins.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use claimgrid_state::{
    AllocationResult, DeviceAllocation, DeviceClass, DeviceId, Node, NodeSelector, ObjectKey,
    ResourceClaim, ResourceSlice,
};

use crate::error::{AllocatorError, AllocatorResult, SelectorOwner};
use crate::inventory::{InventoryDevice, NodeInventory};
use crate::predicate::Predicate;

#[derive(Debug, Clone)]
struct CompiledSelector {
    owner: SelectorOwner,
    index: usize,
    predicate: Predicate,
}

#[derive(Debug, Clone)]
struct RequestPlan {
    claim: usize,
    name: String,
    count: usize,
    /// Class selectors first, then the request's own.
    selectors: Vec<CompiledSelector>,
}

/// One device pick within the search: the `nth` device of `request`.
#[derive(Debug, Clone, Copy)]
struct Slot {
    request: usize,
    nth: usize,
}

/// Prepared allocation problem for a set of claims.
#[derive(Debug, Clone)]
pub struct Allocator {
    claims: Vec<ObjectKey>,
    requests: Vec<RequestPlan>,
    in_use: HashSet<DeviceId>,
}

fn compile_all(
    owner: &SelectorOwner,
    sources: &[String],
) -> AllocatorResult<Vec<CompiledSelector>> {
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            Predicate::compile(source)
                .map(|predicate| CompiledSelector {
                    owner: owner.clone(),
                    index,
                    predicate,
                })
                .map_err(|source| AllocatorError::Compile {
                    owner: owner.clone(),
                    index,
                    source,
                })
        })
        .collect()
}

impl Allocator {
    /// Resolve classes and compile selectors for `claims`.
    ///
    /// `in_use` lists devices already allocated elsewhere; they are never
    /// handed out again.
    pub fn new(
        claims: &[ResourceClaim],
        classes: &BTreeMap<String, DeviceClass>,
        in_use: HashSet<DeviceId>,
    ) -> AllocatorResult<Self> {
        let mut requests = Vec::new();
        for (claim_index, claim) in claims.iter().enumerate() {
            let claim_key = claim.meta.key().to_string();
            let claim_owner = SelectorOwner::Claim(claim_key.clone());
            for request in &claim.spec.requests {
                let class = classes.get(&request.device_class_name).ok_or_else(|| {
                    AllocatorError::MissingClass {
                        request: request.name.clone(),
                        class: request.device_class_name.clone(),
                    }
                })?;
                if request.count == 0 {
                    return Err(AllocatorError::InvalidCount {
                        claim: claim_key,
                        request: request.name.clone(),
                    });
                }
                let class_owner = SelectorOwner::Class(class.meta.name.clone());
                let mut selectors = compile_all(&class_owner, &class.selectors)?;
                selectors.extend(compile_all(&claim_owner, &request.selectors)?);
                requests.push(RequestPlan {
                    claim: claim_index,
                    name: request.name.clone(),
                    count: request.count as usize,
                    selectors,
                });
            }
        }

        Ok(Self {
            claims: claims.iter().map(|c| c.meta.key()).collect(),
            requests,
            in_use,
        })
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Mark more devices as in use, e.g. ones allocated since preparation.
    pub fn exclude(&mut self, devices: impl IntoIterator<Item = DeviceId>) {
        self.in_use.extend(devices);
    }

    /// Try to satisfy every claim from the devices reachable on `node`.
    ///
    /// Returns one allocation per claim, in input order, or `None` if no
    /// assignment exists. A selector evaluation error is returned instead
    /// of `None` when it left a request without enough candidates.
    pub fn allocate(
        &self,
        node: &Node,
        slices: &[ResourceSlice],
    ) -> AllocatorResult<Option<Vec<AllocationResult>>> {
        let inventory = NodeInventory::for_node(&node.name, slices);

        let mut candidates = Vec::with_capacity(self.requests.len());
        for request in &self.requests {
            let (matching, eval_error) = self.candidates(request, &inventory.devices);
            if matching.len() < request.count {
                if let Some(err) = eval_error {
                    debug!(
                        node = %node.name,
                        request = %request.name,
                        error = %err,
                        "selector failed at runtime"
                    );
                    return Err(err);
                }
                debug!(
                    node = %node.name,
                    claim = %self.claims[request.claim],
                    request = %request.name,
                    needed = request.count,
                    found = matching.len(),
                    "not enough matching devices"
                );
                return Ok(None);
            }
            candidates.push(matching);
        }

        let slots: Vec<Slot> = self
            .requests
            .iter()
            .enumerate()
            .flat_map(|(request, plan)| (0..plan.count).map(move |nth| Slot { request, nth }))
            .collect();
        let mut used = vec![false; inventory.devices.len()];
        let mut picks = Vec::with_capacity(slots.len());
        if !search(&slots, &candidates, &mut used, &mut picks) {
            debug!(node = %node.name, claims = self.claims.len(), "no exclusive device assignment");
            return Ok(None);
        }

        let mut results = vec![AllocationResult::default(); self.claims.len()];
        let mut node_local = vec![false; self.claims.len()];
        for (slot, pick) in slots.iter().zip(&picks) {
            let plan = &self.requests[slot.request];
            let device = &inventory.devices[candidates[slot.request][*pick]];
            node_local[plan.claim] |= device.node_local;
            results[plan.claim].devices.push(DeviceAllocation {
                request: plan.name.clone(),
                driver: device.id.driver.clone(),
                pool: device.id.pool.clone(),
                device: device.id.device.clone(),
            });
        }
        for (result, local) in results.iter_mut().zip(node_local) {
            if local {
                result.node_selector = Some(NodeSelector::for_node(&node.name));
            }
        }

        debug!(node = %node.name, claims = self.claims.len(), "devices allocated");
        Ok(Some(results))
    }

    /// Indices of devices usable for `request`, plus the first evaluation
    /// error encountered.
    fn candidates(
        &self,
        request: &RequestPlan,
        devices: &[InventoryDevice<'_>],
    ) -> (Vec<usize>, Option<AllocatorError>) {
        let mut matching = Vec::new();
        let mut first_error = None;
        'devices: for (index, device) in devices.iter().enumerate() {
            if self.in_use.contains(&device.id) {
                continue;
            }
            let view = device.view();
            for selector in &request.selectors {
                match selector.predicate.matches(&view) {
                    Ok(true) => {}
                    Ok(false) => continue 'devices,
                    Err(source) => {
                        if first_error.is_none() {
                            first_error = Some(AllocatorError::Eval {
                                owner: selector.owner.clone(),
                                index: selector.index,
                                source,
                            });
                        }
                        continue 'devices;
                    }
                }
            }
            matching.push(index);
        }
        (matching, first_error)
    }
}

/// Depth-first search over slots. `picks[i]` is a position in the
/// candidate list of slot `i`'s request; picks for one request increase
/// strictly so each device set is tried once.
fn search(
    slots: &[Slot],
    candidates: &[Vec<usize>],
    used: &mut [bool],
    picks: &mut Vec<usize>,
) -> bool {
    let pos = picks.len();
    let Some(slot) = slots.get(pos) else {
        return true;
    };
    let start = if slot.nth > 0 { picks[pos - 1] + 1 } else { 0 };
    let pool = &candidates[slot.request];
    for (offset, &device) in pool.iter().enumerate().skip(start) {
        if used[device] {
            continue;
        }
        used[device] = true;
        picks.push(offset);
        if search(slots, candidates, used, picks) {
            return true;
        }
        picks.pop();
        used[device] = false;
    }
    false
}
