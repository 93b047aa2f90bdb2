//! Requeue evaluator: decides from an `(old, new)` change notification
//! whether a workload rejected earlier should be tried again.
//!
//! Decisions look only at the two states carried by the event; delivery
//! may skip intermediate states.

use tracing::{debug, trace};

use claimgrid_state::{
    ChangeAction, ChangeEvent, ControlPlaneContext, ObjectKind, ResourceClaim, StoredObject,
    WatchedObject, Workload,
};

use crate::coordinator::ClaimCoordinator;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::resolve::resolve_claims;
use crate::status::QueueingHint;

/// Object kinds a coordinator watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedKind {
    ResourceClaim,
    ControlPlaneContext,
    DeviceClass,
    ResourceSlice,
    Node,
}

/// One watched kind, the actions of interest and whether a hint function
/// narrows the decision. Without a hint every matching event queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRegistration {
    pub kind: WatchedKind,
    pub actions: Vec<ChangeAction>,
    pub hinted: bool,
}

/// Split an event into typed `(old, new)` states, unwrapping tombstones.
/// A tombstone as the new state counts as deletion.
fn typed<'a, T: StoredObject>(
    handler: &'static str,
    old: Option<&'a WatchedObject>,
    new: Option<&'a WatchedObject>,
) -> CoordinatorResult<(Option<&'a T>, Option<&'a T>)> {
    let cast = |obj: &'a WatchedObject| {
        let obj = obj.unwrap_tombstone();
        T::from_watched(obj).ok_or(CoordinatorError::UnexpectedObject {
            handler,
            expected: kind_name::<T>(),
            got: obj.kind_name(),
        })
    };
    let old = old.map(cast).transpose()?;
    let new = match new {
        Some(obj) if obj.is_tombstone() => {
            cast(obj)?;
            None
        }
        Some(obj) => Some(cast(obj)?),
        None => None,
    };
    Ok((old, new))
}

fn kind_name<T: StoredObject>() -> &'static str {
    match T::KIND {
        ObjectKind::ResourceClaim => "ResourceClaim",
        ObjectKind::DeviceClass => "DeviceClass",
        ObjectKind::ResourceSlice => "ResourceSlice",
        ObjectKind::ControlPlaneContext => "ControlPlaneContext",
    }
}

impl ClaimCoordinator {
    /// Watched kinds and actions that may make a rejected workload
    /// schedulable.
    pub fn events_to_register(&self) -> Vec<EventRegistration> {
        let add_update = || vec![ChangeAction::Add, ChangeAction::Update];
        let mut events = vec![EventRegistration {
            kind: WatchedKind::ResourceClaim,
            actions: add_update(),
            hinted: true,
        }];
        if self.config.control_plane_controller {
            events.push(EventRegistration {
                kind: WatchedKind::ControlPlaneContext,
                actions: add_update(),
                hinted: true,
            });
        }
        for kind in [WatchedKind::DeviceClass, WatchedKind::ResourceSlice, WatchedKind::Node] {
            events.push(EventRegistration {
                kind,
                actions: add_update(),
                hinted: false,
            });
        }
        events
    }

    /// Dispatch a change notification to the matching hint function.
    pub fn queueing_hint(
        &self,
        workload: &Workload,
        event: &ChangeEvent,
    ) -> CoordinatorResult<QueueingHint> {
        let Some(subject) = event.new.as_ref().or(event.old.as_ref()) else {
            return Ok(QueueingHint::QueueSkip);
        };
        let (old, new) = (event.old.as_ref(), event.new.as_ref());
        match subject.unwrap_tombstone() {
            WatchedObject::ResourceClaim(_) => self.claim_hint(workload, old, new),
            WatchedObject::ControlPlaneContext(_) if self.config.control_plane_controller => {
                self.context_hint(workload, old, new)
            }
            WatchedObject::ControlPlaneContext(_) => Ok(QueueingHint::QueueSkip),
            WatchedObject::DeviceClass(_)
            | WatchedObject::ResourceSlice(_)
            | WatchedObject::Node(_) => Ok(match event.action() {
                ChangeAction::Delete => QueueingHint::QueueSkip,
                ChangeAction::Add | ChangeAction::Update => QueueingHint::Queue,
            }),
            WatchedObject::Tombstone(_) => Ok(QueueingHint::QueueSkip),
        }
    }

    // ── Claims ─────────────────────────────────────────────────────

    /// Whether a claim change may make `workload` schedulable.
    pub fn claim_hint(
        &self,
        workload: &Workload,
        old: Option<&WatchedObject>,
        new: Option<&WatchedObject>,
    ) -> CoordinatorResult<QueueingHint> {
        let (original, modified) = typed::<ResourceClaim>("claim_hint", old, new)?;
        let Some(modified) = modified else {
            return Ok(QueueingHint::QueueSkip);
        };
        let workload_key = workload.key();

        let modified_key = modified.key();
        let resolved = resolve_claims(workload, |key| {
            if *key == modified_key {
                Some(modified.clone())
            } else {
                self.claims.get(key)
            }
        });
        let uses_claim = match resolved {
            Ok(entries) => entries.iter().any(|e| e.claim.meta.uid == modified.meta.uid),
            Err(reason) => {
                trace!(
                    workload = %workload_key,
                    claim = %modified_key,
                    %reason,
                    "workload still not schedulable"
                );
                return Ok(QueueingHint::QueueSkip);
            }
        };

        if original.is_some_and(ResourceClaim::is_allocated_with_structured_parameters)
            && modified.status.allocation.is_none()
        {
            // May free devices for any workload, not just the claim's users.
            debug!(workload = %workload_key, claim = %modified_key, "structured claim deallocated");
            return Ok(QueueingHint::Queue);
        }
        if !uses_claim {
            return Ok(QueueingHint::QueueSkip);
        }
        let Some(original) = original else {
            debug!(workload = %workload_key, claim = %modified_key, "claim created");
            return Ok(QueueingHint::Queue);
        };
        if original.status == modified.status {
            trace!(workload = %workload_key, claim = %modified_key, "claim status unchanged");
            return Ok(QueueingHint::QueueSkip);
        }
        debug!(workload = %workload_key, claim = %modified_key, "claim status changed");
        Ok(QueueingHint::Queue)
    }

    // ── Contexts ───────────────────────────────────────────────────

    /// Whether a control plane context change may make `workload`
    /// schedulable.
    pub fn context_hint(
        &self,
        workload: &Workload,
        old: Option<&WatchedObject>,
        new: Option<&WatchedObject>,
    ) -> CoordinatorResult<QueueingHint> {
        let (original, modified) = typed::<ControlPlaneContext>("context_hint", old, new)?;
        let Some(context) = modified else {
            return Ok(QueueingHint::QueueSkip);
        };
        let workload_key = workload.key();
        if context.key() != workload_key {
            return Ok(QueueingHint::QueueSkip);
        }

        let entries = match self.resolve(workload) {
            Ok(entries) => entries,
            Err(reason) => {
                trace!(workload = %workload_key, %reason, "workload still not schedulable");
                return Ok(QueueingHint::QueueSkip);
            }
        };
        let missing_information = entries
            .iter()
            .filter(|e| !e.claim.is_allocated() && e.claim.uses_control_plane())
            .any(|e| context.claim_status(&e.slot).is_none());
        if missing_information {
            trace!(workload = %workload_key, "waiting for more controller information");
            return Ok(QueueingHint::QueueSkip);
        }

        let Some(original) = original else {
            return Ok(QueueingHint::Queue);
        };
        if original.status.claims.len() < context.status.claims.len() {
            debug!(workload = %workload_key, "controllers provided new information");
            return Ok(QueueingHint::Queue);
        }

        if let Some(selected) = context.spec.selected_node.as_deref() {
            let rejected = context
                .status
                .claims
                .iter()
                .any(|c| c.unsuitable_nodes.iter().any(|n| n == selected));
            if rejected {
                debug!(
                    workload = %workload_key,
                    node = selected,
                    "selected node became unsuitable"
                );
                return Ok(QueueingHint::Queue);
            }
        }

        if original.spec != context.spec && original.status == context.status {
            trace!(workload = %workload_key, "only the scheduler's own fields changed");
            return Ok(QueueingHint::QueueSkip);
        }
        Ok(QueueingHint::Queue)
    }
}
