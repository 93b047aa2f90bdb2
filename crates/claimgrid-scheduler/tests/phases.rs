//! Coordinator phase tests.
//!
//! Each test drives one scheduling attempt through the phases in the order
//! the host pipeline calls them, checking statuses and the stored, assumed
//! and in-flight state after each step.

mod common;

use claimgrid_scheduler::*;
use claimgrid_state::*;

use common::*;

fn setup(claims: Vec<ResourceClaim>, slices: Vec<ResourceSlice>) -> (StateStore, ClaimCoordinator) {
    let store = test_store();
    store.create(&test_class()).unwrap();
    for claim in claims {
        store.create(&claim).unwrap();
    }
    for slice in slices {
        store.create(&slice).unwrap();
    }
    let coordinator = test_coordinator(&store);
    (store, coordinator)
}

// ── Skips and admission ────────────────────────────────────────────

#[test]
fn workload_without_claims_is_skipped() {
    let (_store, coordinator) = setup(vec![], vec![]);
    let workload = workload_with_claims(&[]);
    let mut state = CycleState::new();

    assert!(coordinator.pre_enqueue(&workload).is_success());
    assert_eq!(coordinator.pre_filter(&mut state, &workload).code(), Code::Skip);
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "no new claims to deallocate",
    );
}

#[test]
fn disabled_coordinator_skips_everything() {
    let store = test_store();
    store
        .create(&allocated_claim(CLAIM, structured_allocation("worker", None)))
        .unwrap();
    let config = CoordinatorConfig {
        enabled: false,
        ..Default::default()
    };
    let coordinator = test_coordinator_with(&store, config);
    let mut state = CycleState::new();
    assert_eq!(coordinator.pre_filter(&mut state, &test_workload()).code(), Code::Skip);
}

#[test]
fn disabled_namespace_skips() {
    let store = test_store();
    store.create(&pending_claim(CLAIM)).unwrap();
    let config = CoordinatorConfig {
        disabled_namespaces: vec!["default".to_string()],
        ..Default::default()
    };
    let coordinator = test_coordinator_with(&store, config);
    let mut state = CycleState::new();
    assert_eq!(coordinator.pre_filter(&mut state, &test_workload()).code(), Code::Skip);
}

#[test]
fn pre_enqueue_rejects_unusable_claims() {
    let (store, coordinator) = setup(vec![], vec![]);

    assert_status(
        &coordinator.pre_enqueue(&template_workload(None)),
        Code::UnschedulableAndUnresolvable,
        "workload \"default/my-workload\": ResourceClaim not created yet",
    );
    assert_status(
        &coordinator.pre_enqueue(&test_workload()),
        Code::UnschedulableAndUnresolvable,
        "waiting for resource claim default/my-claim to be created",
    );

    let mut foreign = pending_claim(TEMPLATE_CLAIM);
    foreign.meta.owner_references.push(OwnerReference {
        kind: WORKLOAD_KIND.to_string(),
        name: "my-workload".to_string(),
        uid: "other-uid".to_string(),
        controller: true,
    });
    store.create(&foreign).unwrap();
    assert_status(
        &coordinator.pre_enqueue(&template_workload(Some(TEMPLATE_CLAIM))),
        Code::UnschedulableAndUnresolvable,
        "ResourceClaim default/my-workload-my-resource was not created for workload \
         default/my-workload (workload is not owner)",
    );
}

#[test]
fn pre_enqueue_rejects_claim_being_deleted() {
    let mut claim = owned_by_workload(pending_claim(TEMPLATE_CLAIM));
    claim.meta.finalizers.push("example.com/keep".to_string());
    let (store, coordinator) = setup(vec![claim], vec![]);
    store
        .delete::<ResourceClaim>(&ObjectKey::new("default", TEMPLATE_CLAIM), None)
        .unwrap();

    assert_status(
        &coordinator.pre_enqueue(&template_workload(Some(TEMPLATE_CLAIM))),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim \"my-workload-my-resource\" is being deleted",
    );
}

#[test]
fn template_claim_passes_pre_enqueue() {
    let claim = owned_by_workload(pending_claim(TEMPLATE_CLAIM));
    let (_store, coordinator) = setup(vec![claim], vec![]);
    assert!(coordinator.pre_enqueue(&template_workload(Some(TEMPLATE_CLAIM))).is_success());
}

// ── PreFilter rejections ───────────────────────────────────────────

#[test]
fn missing_class_is_unresolvable() {
    let store = test_store();
    store.create(&delegated_claim(CLAIM)).unwrap();
    let coordinator = test_coordinator(&store);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert_status(
        &coordinator.pre_filter(&mut state, &workload),
        Code::UnschedulableAndUnresolvable,
        "request req-1: device class my-resource-class does not exist",
    );
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "no new claims to deallocate",
    );
}

#[test]
fn claim_waiting_for_deallocation() {
    let mut claim = allocated_claim(CLAIM, structured_allocation("worker", None));
    claim.status.deallocation_requested = true;
    let (_store, coordinator) = setup(vec![claim], vec![]);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert_status(
        &coordinator.pre_filter(&mut state, &workload),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim must be reallocated",
    );
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "no new claims to deallocate",
    );
}

#[test]
fn claim_at_reservation_capacity_is_in_use() {
    let mut claim = allocated_claim(CLAIM, structured_allocation("worker", None));
    claim.status.reserved_for.push(ConsumerReference {
        resource: WORKLOAD_RESOURCE.to_string(),
        name: "someone-else".to_string(),
        uid: "other-uid".to_string(),
    });
    let store = test_store();
    store.create(&claim).unwrap();
    let config = CoordinatorConfig {
        max_reserved_for: 1,
        ..Default::default()
    };
    let coordinator = test_coordinator_with(&store, config);
    let mut state = CycleState::new();

    assert_status(
        &coordinator.pre_filter(&mut state, &test_workload()),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim in use",
    );
}

#[test]
fn delegated_claim_rejected_when_controller_support_disabled() {
    let store = test_store();
    store.create(&test_class()).unwrap();
    store.create(&delegated_claim(CLAIM)).unwrap();
    let config = CoordinatorConfig {
        control_plane_controller: false,
        ..Default::default()
    };
    let coordinator = test_coordinator_with(&store, config);
    let mut state = CycleState::new();

    assert_status(
        &coordinator.pre_filter(&mut state, &test_workload()),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim has a control plane controller, but support is disabled",
    );
}

// ── Already allocated claims ───────────────────────────────────────

#[test]
fn reserved_claim_passes_every_phase_untouched() {
    let mut claim = allocated_claim(CLAIM, structured_allocation("worker", None));
    let workload = test_workload();
    claim.status.reserved_for.push(workload.as_consumer());
    let (store, coordinator) = setup(vec![claim], vec![]);
    let before = stored_claim(&store, CLAIM);
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_enqueue(&workload).is_success());
    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.filter(&cancel, &state, &workload, &worker).is_success());
    assert!(coordinator
        .pre_score(&cancel, &mut state, &workload, &[worker.clone(), test_node("worker-2")])
        .is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker).is_success());
    assert!(coordinator.post_bind(&mut state, &workload, &worker).is_success());

    assert_eq!(stored_claim(&store, CLAIM), before);
    assert!(coordinator.in_flight().is_empty());
    assert!(stored_context(&store).is_none());
}

#[test]
fn allocated_claim_gets_reserved_in_pre_bind() {
    let selector = NodeSelector::for_node("worker");
    let claim = allocated_claim(CLAIM, structured_allocation("worker", Some(selector)));
    let (store, coordinator) = setup(vec![claim], vec![]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.filter(&cancel, &state, &workload, &worker).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker).is_success());

    let stored = stored_claim(&store, CLAIM);
    assert_eq!(stored.status.reserved_for, vec![workload.as_consumer()]);
    assert!(stored.meta.finalizers.is_empty());
}

#[test]
fn bind_failure_removes_reservation() {
    let selector = NodeSelector::for_node("worker");
    let claim = allocated_claim(CLAIM, structured_allocation("worker", Some(selector)));
    let (store, coordinator) = setup(vec![claim], vec![]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker).is_success());
    assert!(stored_claim(&store, CLAIM).is_reserved_for(&workload));

    // Binding failed after PreBind.
    assert!(coordinator.unreserve(&mut state, &workload, &worker).is_success());
    let stored = stored_claim(&store, CLAIM);
    assert!(stored.status.reserved_for.is_empty());
    assert!(stored.is_allocated());
}

#[test]
fn wrong_topology_structured_claim_is_deallocated() {
    let mut claim = allocated_claim(
        CLAIM,
        structured_allocation("other", Some(NodeSelector::for_node("other"))),
    );
    claim.meta.finalizers.push(CoordinatorConfig::default().finalizer);
    let (store, coordinator) = setup(vec![claim], vec![]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&cancel, &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim not available on the node",
    );
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "deallocation of ResourceClaim completed",
    );

    let stored = stored_claim(&store, CLAIM);
    assert!(stored.status.allocation.is_none());
    assert!(stored.meta.finalizers.is_empty());
    assert!(!stored.status.deallocation_requested);
}

#[test]
fn wrong_topology_delegated_claim_requests_deallocation() {
    let mut claim = delegated_claim(CLAIM);
    claim.status.allocation = Some(AllocationResult {
        controller: Some(DRIVER.to_string()),
        devices: Vec::new(),
        node_selector: Some(NodeSelector::label_in("zone", &["b"])),
    });
    let (store, coordinator) = setup(vec![claim], vec![]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    let worker = test_node("worker").with_label("zone", "a");
    assert_status(
        &coordinator.filter(&cancel, &state, &workload, &worker),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim not available on the node",
    );
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "deallocation of ResourceClaim completed",
    );
    let stored = stored_claim(&store, CLAIM);
    assert!(stored.status.deallocation_requested);
    assert!(stored.is_allocated());

    // The next attempt waits for the controller.
    let mut next = CycleState::new();
    assert_status(
        &coordinator.pre_filter(&mut next, &workload),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim must be reallocated",
    );
}

#[test]
fn claim_shared_with_other_consumer_is_not_deallocated() {
    let mut claim = allocated_claim(
        CLAIM,
        structured_allocation("other", Some(NodeSelector::for_node("other"))),
    );
    claim.status.reserved_for.push(ConsumerReference {
        resource: WORKLOAD_RESOURCE.to_string(),
        name: "someone-else".to_string(),
        uid: "other-uid".to_string(),
    });
    let (store, coordinator) = setup(vec![claim], vec![]);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    let cancel = CancellationToken::new();
    let status = coordinator.filter(&cancel, &state, &workload, &test_node("worker"));
    assert!(status.is_rejected());
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "no new claims to deallocate",
    );
    assert!(stored_claim(&store, CLAIM).is_allocated());
}

// ── Structured allocation ──────────────────────────────────────────

#[test]
fn structured_claim_full_cycle() {
    let (store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let key = ObjectKey::new("default", CLAIM);
    let mut state = CycleState::new();

    assert!(coordinator.pre_enqueue(&workload).is_success());
    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.filter(&cancel, &state, &workload, &worker).is_success());

    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    let uid = stored_claim(&store, CLAIM).meta.uid;
    let in_flight = coordinator.in_flight().get(&uid).unwrap();
    let expected = structured_allocation("worker", Some(NodeSelector::for_node("worker")));
    assert_eq!(in_flight.allocation, expected);
    assert!(coordinator.claim_cache().is_assumed(&key));
    assert_eq!(
        coordinator.claim_cache().get(&key).unwrap().status.allocation,
        Some(expected.clone())
    );
    assert!(stored_claim(&store, CLAIM).status.allocation.is_none());

    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker).is_success());
    let stored = stored_claim(&store, CLAIM);
    assert_eq!(stored.status.allocation, Some(expected));
    assert_eq!(stored.status.reserved_for, vec![workload.as_consumer()]);
    assert!(stored.meta.has_finalizer(&coordinator.config().finalizer));
    assert!(coordinator.in_flight().is_empty());

    assert!(coordinator.post_bind(&mut state, &workload, &worker).is_success());
    assert!(!coordinator.claim_cache().is_assumed(&key));
    assert_eq!(coordinator.claim_cache().get(&key), Some(stored));
}

#[test]
fn existing_finalizer_is_kept_once() {
    let mut claim = pending_claim(CLAIM);
    claim.meta.finalizers.push(CoordinatorConfig::default().finalizer);
    let (store, coordinator) = setup(vec![claim], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker).is_success());
    assert_eq!(stored_claim(&store, CLAIM).meta.finalizers.len(), 1);
}

#[test]
fn structured_claim_without_devices() {
    let (_store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![]);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&CancellationToken::new(), &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        "cannot allocate all claims",
    );
    assert_status(
        &coordinator.post_filter(&state, &workload),
        Code::Unschedulable,
        "no new claims to deallocate",
    );
}

#[test]
fn devices_of_other_claims_are_exhausted() {
    let other = allocated_claim(
        "other-claim",
        structured_allocation("worker", Some(NodeSelector::for_node("worker"))),
    );
    let (_store, coordinator) =
        setup(vec![pending_claim(CLAIM), other], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&CancellationToken::new(), &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        "cannot allocate all claims",
    );
}

#[test]
fn unreserve_restores_state_before_reserve() {
    let (store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let worker = test_node("worker");
    let key = ObjectKey::new("default", CLAIM);
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    let cached_before = coordinator.claim_cache().get(&key);
    let in_flight_before = coordinator.in_flight().snapshot();

    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert_eq!(coordinator.in_flight().len(), 1);

    assert!(coordinator.unreserve(&mut state, &workload, &worker).is_success());
    assert_eq!(coordinator.claim_cache().get(&key), cached_before);
    assert_eq!(coordinator.in_flight().snapshot(), in_flight_before);
    assert!(!coordinator.claim_cache().is_assumed(&key));
    assert!(stored_claim(&store, CLAIM).status.allocation.is_none());

    // Idempotent.
    assert!(coordinator.unreserve(&mut state, &workload, &worker).is_success());
    assert_eq!(coordinator.claim_cache().get(&key), cached_before);
}

#[test]
fn pre_bind_conflict_is_an_error() {
    let (store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());

    let mut changed = stored_claim(&store, CLAIM);
    changed.meta.labels.insert("hello".to_string(), "world".to_string());
    store.update(&changed).unwrap();

    let status = coordinator.pre_bind(&cancel, &mut state, &workload, &worker);
    assert_eq!(status.code(), Code::Error);
    assert!(coordinator.in_flight().is_empty());

    assert!(coordinator.unreserve(&mut state, &workload, &worker).is_success());
    let stored = stored_claim(&store, CLAIM);
    assert!(stored.status.allocation.is_none());
    assert!(stored.status.reserved_for.is_empty());
}

#[test]
fn in_flight_claim_blocks_other_workload() {
    let (_store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let worker = test_node("worker");
    let mut state = CycleState::new();
    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());

    let other = Workload {
        name: "other-workload".to_string(),
        uid: "other-uid".to_string(),
        ..test_workload()
    };
    let mut other_state = CycleState::new();
    assert_status(
        &coordinator.pre_filter(&mut other_state, &other),
        Code::UnschedulableAndUnresolvable,
        "resource claim default/my-claim is in the process of being allocated",
    );
}

#[test]
fn in_flight_allocation_is_not_committed_by_other_workload() {
    let (store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let worker = test_node("worker");
    let cancel = CancellationToken::new();
    let mut state = CycleState::new();
    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());

    let other = Workload {
        name: "other-workload".to_string(),
        uid: "other-uid".to_string(),
        ..test_workload()
    };
    let mut other_state = CycleState::new();
    assert!(!coordinator.pre_filter(&mut other_state, &other).is_success());
    assert!(!coordinator.pre_bind(&cancel, &mut other_state, &other, &worker).is_success());

    assert!(coordinator.unreserve(&mut state, &workload, &worker).is_success());
    let stored = stored_claim(&store, CLAIM);
    assert!(stored.status.allocation.is_none());
    assert!(stored.status.reserved_for.is_empty());
    assert!(stored.meta.finalizers.is_empty());
    assert!(coordinator.in_flight().is_empty());
    assert!(!coordinator.claim_cache().is_assumed(&ObjectKey::new("default", CLAIM)));
}

#[test]
fn reserved_devices_are_not_handed_out_twice() {
    let (_store, coordinator) = setup(
        vec![pending_claim(CLAIM), pending_claim("other-claim")],
        vec![healthy_slice("worker")],
    );
    let worker = test_node("worker");
    let first = test_workload();
    let second = Workload {
        name: "other-workload".to_string(),
        uid: "other-uid".to_string(),
        ..workload_with_claims(&["other-claim"])
    };

    let mut first_state = CycleState::new();
    assert!(coordinator.pre_filter(&mut first_state, &first).is_success());
    assert!(coordinator.reserve(&mut first_state, &first, &worker).is_success());

    let mut second_state = CycleState::new();
    assert!(coordinator.pre_filter(&mut second_state, &second).is_success());
    assert_status(
        &coordinator.filter(&CancellationToken::new(), &second_state, &second, &worker),
        Code::UnschedulableAndUnresolvable,
        "cannot allocate all claims",
    );
}

#[test]
fn concurrent_reserves_admit_one_allocation() {
    let (_store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let worker = test_node("worker");
    let (coordinator, workload, worker) = (&coordinator, &workload, &worker);

    let successes: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(move || {
                    let mut state = CycleState::new();
                    if !coordinator.pre_filter(&mut state, &workload).is_success() {
                        return 0;
                    }
                    usize::from(coordinator.reserve(&mut state, &workload, &worker).is_success())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(successes, 1);
    assert_eq!(coordinator.in_flight().len(), 1);
}

#[test]
fn concurrent_reserves_never_share_a_device() {
    let other = Workload {
        name: "other-workload".to_string(),
        uid: "other-uid".to_string(),
        ..workload_with_claims(&["other-claim"])
    };
    let worker = test_node("worker");

    for _ in 0..200 {
        let (_store, coordinator) = setup(
            vec![pending_claim(CLAIM), pending_claim("other-claim")],
            vec![healthy_slice("worker")],
        );
        let barrier = std::sync::Barrier::new(2);
        let workloads = [test_workload(), other.clone()];
        let (coordinator, barrier, worker) = (&coordinator, &barrier, &worker);

        let successes: usize = std::thread::scope(|s| {
            let handles: Vec<_> = workloads
                .iter()
                .map(|workload| {
                    s.spawn(move || {
                        let mut state = CycleState::new();
                        let prepared = coordinator.pre_filter(&mut state, workload).is_success();
                        barrier.wait();
                        prepared && coordinator.reserve(&mut state, workload, worker).is_success()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(successes, 1);
        assert_eq!(coordinator.in_flight().devices().len(), 1);
    }
}

#[test]
fn cancelled_attempt_reports_error() {
    let (_store, coordinator) = setup(vec![pending_claim(CLAIM)], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let mut state = CycleState::new();
    assert!(coordinator.pre_filter(&mut state, &workload).is_success());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let status = coordinator.filter(&cancel, &state, &workload, &test_node("worker"));
    assert_status(&status, Code::Error, "scheduling attempt cancelled");
    let status = coordinator.pre_score(&cancel, &mut state, &workload, &[test_node("worker")]);
    assert_eq!(status.code(), Code::Error);
}

// ── Selector errors ────────────────────────────────────────────────

fn broken_claim() -> ResourceClaim {
    let mut claim = pending_claim(CLAIM);
    claim.spec.requests[0].selectors.push(HEALTHY_SELECTOR.to_string());
    claim
}

const RUNTIME_ERROR: &str =
    "claim default/my-claim: selector #0: runtime error: no such key: healthy";

#[test]
fn runtime_error_on_one_of_two_nodes() {
    let (_store, coordinator) = setup(
        vec![broken_claim()],
        vec![bare_slice("worker"), healthy_slice("worker-2")],
    );
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&cancel, &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        RUNTIME_ERROR,
    );
    let worker2 = test_node("worker-2");
    assert!(coordinator.filter(&cancel, &state, &workload, &worker2).is_success());

    // One feasible node: PreScore is not called and scheduling proceeds.
    assert!(coordinator.reserve(&mut state, &workload, &worker2).is_success());
    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker2).is_success());
}

#[test]
fn runtime_error_on_one_of_three_nodes_blocks_pre_score() {
    let (_store, coordinator) = setup(
        vec![broken_claim()],
        vec![bare_slice("worker"), healthy_slice("worker-2"), healthy_slice("worker-3")],
    );
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&cancel, &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        RUNTIME_ERROR,
    );
    let feasible = vec![test_node("worker-2"), test_node("worker-3")];
    for node in &feasible {
        assert!(coordinator.filter(&cancel, &state, &workload, node).is_success());
    }
    assert_status(
        &coordinator.pre_score(&cancel, &mut state, &workload, &feasible),
        Code::UnschedulableAndUnresolvable,
        &format!("filter node worker: {RUNTIME_ERROR}"),
    );
}

#[test]
fn runtime_error_in_class_names_the_class() {
    let store = test_store();
    let mut class = test_class();
    class.selectors.push(HEALTHY_SELECTOR.to_string());
    store.create(&class).unwrap();
    store.create(&pending_claim(CLAIM)).unwrap();
    store.create(&bare_slice("worker")).unwrap();
    let coordinator = test_coordinator(&store);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&CancellationToken::new(), &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        "class my-resource-class: selector #0: runtime error: no such key: healthy",
    );
}

#[test]
fn compile_error_fails_filter_for_every_node() {
    let mut claim = pending_claim(CLAIM);
    claim.spec.requests[0].selectors.push("device.driver ==".to_string());
    let (_store, coordinator) = setup(vec![claim], vec![healthy_slice("worker")]);
    let workload = test_workload();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    for node in ["worker", "worker-2"] {
        let status =
            coordinator.filter(&CancellationToken::new(), &state, &workload, &test_node(node));
        assert_eq!(status.code(), Code::Error);
        assert!(status.message().unwrap().starts_with("claim default/my-claim: selector #0:"));
    }
}

// ── Control plane handshake ────────────────────────────────────────

fn setup_delegated(
    claims: Vec<ResourceClaim>,
    context: Option<ControlPlaneContext>,
) -> (StateStore, ClaimCoordinator) {
    let store = test_store();
    store.create(&test_class()).unwrap();
    for claim in claims {
        store.create(&claim).unwrap();
    }
    if let Some(context) = context {
        store.create(&context).unwrap();
    }
    let coordinator = test_coordinator(&store);
    (store, coordinator)
}

fn context_with_info(potential: &[&str]) -> ControlPlaneContext {
    let mut context = ControlPlaneContext::for_workload(&test_workload());
    context.spec.potential_nodes = potential.iter().map(|n| n.to_string()).collect();
    context.status.claims.push(ClaimSchedulingStatus {
        name: SLOT.to_string(),
        unsuitable_nodes: Vec::new(),
    });
    context
}

#[test]
fn single_delegated_claim_selects_node_immediately() {
    let (store, coordinator) = setup_delegated(vec![delegated_claim(CLAIM)], None);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.filter(&cancel, &state, &workload, &worker).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert_status(
        &coordinator.pre_bind(&cancel, &mut state, &workload, &worker),
        Code::Pending,
        "waiting for resource driver",
    );

    let context = stored_context(&store).unwrap();
    assert_eq!(context.spec.selected_node.as_deref(), Some("worker"));
    assert_eq!(context.spec.potential_nodes, vec!["worker"]);
    assert_eq!(context.meta.controller_owner().unwrap().uid, WORKLOAD_UID);
    assert!(stored_claim(&store, CLAIM).status.reserved_for.is_empty());
}

#[test]
fn several_delegated_claims_ask_for_information() {
    let (store, coordinator) =
        setup_delegated(vec![delegated_claim(CLAIM), delegated_claim("my-claim-2")], None);
    let workload = workload_with_claims(&[CLAIM, "my-claim-2"]);
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert_status(
        &coordinator.pre_bind(&cancel, &mut state, &workload, &worker),
        Code::Pending,
        "waiting for resource driver",
    );

    let context = stored_context(&store).unwrap();
    assert!(context.spec.selected_node.is_none());
    assert_eq!(context.spec.potential_nodes, vec!["worker"]);
}

#[test]
fn controller_information_lets_reserve_select_node() {
    let (store, coordinator) =
        setup_delegated(vec![delegated_claim(CLAIM)], Some(context_with_info(&["worker"])));
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert_status(
        &coordinator.pre_bind(&cancel, &mut state, &workload, &worker),
        Code::Pending,
        "waiting for resource driver",
    );
    let context = stored_context(&store).unwrap();
    assert_eq!(context.spec.selected_node.as_deref(), Some("worker"));
    assert_eq!(context.spec.potential_nodes, vec!["worker"]);
}

#[test]
fn selected_node_already_published_waits_for_controller() {
    let mut context = context_with_info(&["worker"]);
    context.spec.selected_node = Some("worker".to_string());
    let (_store, coordinator) = setup_delegated(vec![delegated_claim(CLAIM)], Some(context));
    let workload = test_workload();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.reserve(&mut state, &workload, &worker),
        Code::Pending,
        "waiting for resource driver to provide information",
    );
}

#[test]
fn concurrent_context_update_fails_pre_bind() {
    let (store, coordinator) =
        setup_delegated(vec![delegated_claim(CLAIM)], Some(context_with_info(&["worker"])));
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());

    let mut changed = stored_context(&store).unwrap();
    changed.meta.labels.insert("hello".to_string(), "world".to_string());
    store.update(&changed).unwrap();

    let status = coordinator.pre_bind(&cancel, &mut state, &workload, &worker);
    assert_eq!(status.code(), Code::Error);
    assert!(stored_context(&store).unwrap().spec.selected_node.is_none());
}

#[test]
fn unsuitable_node_is_filtered() {
    let mut context = context_with_info(&["worker", "worker-2"]);
    context.status.claims[0].unsuitable_nodes.push("worker".to_string());
    let (_store, coordinator) = setup_delegated(vec![delegated_claim(CLAIM)], Some(context));
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert_status(
        &coordinator.filter(&cancel, &state, &workload, &test_node("worker")),
        Code::UnschedulableAndUnresolvable,
        "resourceclaim cannot be allocated for the node (unsuitable)",
    );
    assert!(coordinator
        .filter(&cancel, &state, &workload, &test_node("worker-2"))
        .is_success());
}

#[test]
fn pre_score_publishes_truncated_sorted_candidates() {
    let store = test_store();
    store.create(&test_class()).unwrap();
    store.create(&delegated_claim(CLAIM)).unwrap();
    let config = CoordinatorConfig {
        max_potential_nodes: 2,
        ..Default::default()
    };
    let coordinator = test_coordinator_with(&store, config);
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let nodes = vec![test_node("worker-3"), test_node("worker"), test_node("worker-2")];
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.pre_score(&cancel, &mut state, &workload, &nodes).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &nodes[1]).is_success());
    assert_eq!(
        coordinator.pre_bind(&cancel, &mut state, &workload, &nodes[1]).code(),
        Code::Pending
    );

    let context = stored_context(&store).unwrap();
    assert_eq!(context.spec.potential_nodes, vec!["worker", "worker-2"]);
    assert_eq!(context.spec.selected_node.as_deref(), Some("worker"));
}

#[test]
fn failed_reserve_publishes_pending_context_in_unreserve() {
    let (store, coordinator) =
        setup_delegated(vec![delegated_claim(CLAIM), delegated_claim("my-claim-2")], None);
    let workload = workload_with_claims(&[CLAIM, "my-claim-2"]);
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert!(coordinator.unreserve(&mut state, &workload, &worker).is_success());
    assert_eq!(stored_context(&store).unwrap().spec.potential_nodes, vec!["worker"]);
}

#[test]
fn post_bind_deletes_context() {
    let mut claim = delegated_claim(CLAIM);
    claim.status.allocation = Some(AllocationResult {
        controller: Some(DRIVER.to_string()),
        devices: Vec::new(),
        node_selector: None,
    });
    let (store, coordinator) = setup_delegated(vec![claim], Some(context_with_info(&["worker"])));
    let workload = test_workload();
    let cancel = CancellationToken::new();
    let worker = test_node("worker");
    let mut state = CycleState::new();

    assert!(coordinator.pre_filter(&mut state, &workload).is_success());
    assert!(coordinator.filter(&cancel, &state, &workload, &worker).is_success());
    assert!(coordinator.reserve(&mut state, &workload, &worker).is_success());
    assert!(coordinator.pre_bind(&cancel, &mut state, &workload, &worker).is_success());
    assert!(stored_claim(&store, CLAIM).is_reserved_for(&workload));

    assert!(coordinator.post_bind(&mut state, &workload, &worker).is_success());
    assert!(stored_context(&store).is_none());
}

#[test]
fn foreign_context_is_an_error() {
    let mut context = context_with_info(&["worker"]);
    context.meta.owner_references[0].uid = "previous-uid".to_string();
    let (_store, coordinator) = setup_delegated(vec![delegated_claim(CLAIM)], Some(context));
    let mut state = CycleState::new();
    assert_eq!(
        coordinator.pre_filter(&mut state, &test_workload()).code(),
        Code::Error
    );
}
