//! Workload claim resolution.
//!
//! Maps a workload's claim slots to the claims they name, checking that
//! each claim exists, is not being deleted and belongs to the workload.

use claimgrid_state::{
    ClaimSource, ObjectKey, ResourceClaim, StoredObject, WORKLOAD_KIND, Workload,
};

use crate::cycle_state::ClaimEntry;

/// Claim name for `slot`, `Ok(None)` when the slot needs no claim.
fn claim_name_for(
    workload: &Workload,
    slot: &str,
    source: &ClaimSource,
) -> Result<Option<String>, String> {
    match source {
        ClaimSource::ClaimName { claim_name } => Ok(Some(claim_name.clone())),
        ClaimSource::Template { .. } => match workload.claim_status(slot) {
            Some(status) => Ok(status.claim_name.clone()),
            None => Err(format!(
                "workload \"{}\": ResourceClaim not created yet",
                workload.key()
            )),
        },
    }
}

fn check_owner(
    workload: &Workload,
    claim: &ResourceClaim,
    from_template: bool,
) -> Result<(), String> {
    let owner = claim.meta.controller_owner();
    let owned = match owner {
        Some(owner) => owner.kind == WORKLOAD_KIND && owner.uid == workload.uid,
        // User-managed claims referenced by name carry no controller.
        None => !from_template,
    };
    if owned {
        return Ok(());
    }
    Err(format!(
        "ResourceClaim {} was not created for workload {} (workload is not owner)",
        claim.key(),
        workload.key()
    ))
}

/// Resolve every claim slot of `workload` through `lookup`.
///
/// The error is a user-facing reason the workload cannot be scheduled
/// until the claims change.
pub(crate) fn resolve_claims(
    workload: &Workload,
    lookup: impl Fn(&ObjectKey) -> Option<ResourceClaim>,
) -> Result<Vec<ClaimEntry>, String> {
    let mut entries = Vec::with_capacity(workload.claims.len());
    for slot in &workload.claims {
        let Some(claim_name) = claim_name_for(workload, &slot.name, &slot.source)? else {
            continue;
        };
        let key = ObjectKey::new(&workload.namespace, &claim_name);
        let claim = lookup(&key)
            .ok_or_else(|| format!("waiting for resource claim {key} to be created"))?;
        if claim.meta.deletion_requested {
            return Err(format!("resourceclaim \"{}\" is being deleted", claim.meta.name));
        }
        let from_template = matches!(slot.source, ClaimSource::Template { .. });
        check_owner(workload, &claim, from_template)?;
        entries.push(ClaimEntry {
            slot: slot.name.clone(),
            claim,
        });
    }
    Ok(entries)
}
