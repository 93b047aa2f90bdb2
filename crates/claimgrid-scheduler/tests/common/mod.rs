//! Fixtures shared by the coordinator integration tests.

#![allow(dead_code)]

use claimgrid_scheduler::*;
use claimgrid_state::*;

pub const DRIVER: &str = "some-driver";
pub const CLASS: &str = "my-resource-class";
pub const WORKLOAD_UID: &str = "workload-uid";
pub const SLOT: &str = "my-resource";
pub const CLAIM: &str = "my-claim";
pub const TEMPLATE_CLAIM: &str = "my-workload-my-resource";

/// Selector that fails at runtime on devices without `healthy`.
pub const HEALTHY_SELECTOR: &str = r#"device.attributes["some-driver"].healthy"#;

pub fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

pub fn test_coordinator(store: &StateStore) -> ClaimCoordinator {
    ClaimCoordinator::new(CoordinatorConfig::default(), store.clone()).unwrap()
}

pub fn test_coordinator_with(store: &StateStore, config: CoordinatorConfig) -> ClaimCoordinator {
    ClaimCoordinator::new(config, store.clone()).unwrap()
}

/// Workload referencing each claim by name, one slot per claim.
pub fn workload_with_claims(claims: &[&str]) -> Workload {
    Workload {
        namespace: "default".to_string(),
        name: "my-workload".to_string(),
        uid: WORKLOAD_UID.to_string(),
        claims: claims
            .iter()
            .enumerate()
            .map(|(i, name)| WorkloadClaim {
                name: if i == 0 { SLOT.to_string() } else { format!("{SLOT}-{i}") },
                source: ClaimSource::ClaimName {
                    claim_name: name.to_string(),
                },
            })
            .collect(),
        claim_statuses: Vec::new(),
    }
}

pub fn test_workload() -> Workload {
    workload_with_claims(&[CLAIM])
}

/// Workload whose single slot comes from a template, with the generated
/// claim name recorded in its status.
pub fn template_workload(generated: Option<&str>) -> Workload {
    let mut workload = workload_with_claims(&[]);
    workload.claims.push(WorkloadClaim {
        name: SLOT.to_string(),
        source: ClaimSource::Template {
            template_name: "my-template".to_string(),
        },
    });
    if let Some(name) = generated {
        workload.claim_statuses.push(WorkloadClaimStatus {
            name: SLOT.to_string(),
            claim_name: Some(name.to_string()),
        });
    }
    workload
}

pub fn test_node(name: &str) -> Node {
    Node::new(name)
}

pub fn test_class() -> DeviceClass {
    DeviceClass::new(CLASS)
}

/// Unallocated claim the coordinator allocates itself.
pub fn pending_claim(name: &str) -> ResourceClaim {
    let mut claim = ResourceClaim::new("default", name);
    claim.spec.requests.push(DeviceRequest {
        name: "req-1".to_string(),
        device_class_name: CLASS.to_string(),
        selectors: Vec::new(),
        count: 1,
    });
    claim
}

/// Unallocated claim delegated to a control plane controller.
pub fn delegated_claim(name: &str) -> ResourceClaim {
    let mut claim = pending_claim(name);
    claim.spec.controller = Some(DRIVER.to_string());
    claim
}

pub fn owned_by_workload(mut claim: ResourceClaim) -> ResourceClaim {
    let workload = test_workload();
    claim.meta.owner_references.push(workload.owner_reference());
    claim
}

/// Structured allocation of `instance-1` in the node's pool.
pub fn structured_allocation(node: &str, selector: Option<NodeSelector>) -> AllocationResult {
    AllocationResult {
        controller: None,
        devices: vec![DeviceAllocation {
            request: "req-1".to_string(),
            driver: DRIVER.to_string(),
            pool: node.to_string(),
            device: "instance-1".to_string(),
        }],
        node_selector: selector,
    }
}

pub fn allocated_claim(name: &str, allocation: AllocationResult) -> ResourceClaim {
    let mut claim = pending_claim(name);
    claim.status.allocation = Some(allocation);
    claim
}

/// Slice with one device `instance-1` marked healthy.
pub fn healthy_slice(node: &str) -> ResourceSlice {
    ResourceSlice::for_node(node, DRIVER)
        .with_device("instance-1", &[("healthy", AttributeValue::Bool(true))])
}

/// Slice with one device `instance-1` carrying no attributes.
pub fn bare_slice(node: &str) -> ResourceSlice {
    ResourceSlice::for_node(node, DRIVER).with_device("instance-1", &[])
}

pub fn stored_claim(store: &StateStore, name: &str) -> ResourceClaim {
    store
        .get::<ResourceClaim>(&ObjectKey::new("default", name))
        .unwrap()
        .unwrap()
}

pub fn stored_context(store: &StateStore) -> Option<ControlPlaneContext> {
    store
        .get::<ControlPlaneContext>(&ObjectKey::new("default", "my-workload"))
        .unwrap()
}

pub fn assert_status(status: &Status, code: Code, message: &str) {
    assert_eq!(status.code(), code, "unexpected status {status}");
    assert_eq!(status.message(), Some(message), "unexpected status {status}");
}
