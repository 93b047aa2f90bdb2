//! Coordinator error types.

use thiserror::Error;

use claimgrid_allocator::AllocatorError;
use claimgrid_state::{DeviceId, ObjectKey, ResourceVersion, StateError};

/// Errors that can occur inside the claim coordinator.
///
/// Phase operations never return these directly; they are folded into a
/// [`Status`](crate::status::Status) with code `Error`.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scheduling attempt cancelled")]
    Cancelled,

    #[error("no state for this scheduling attempt")]
    MissingCycleState,

    #[error("{key} is not in the assume cache")]
    NotCached { key: ObjectKey },

    #[error("cannot assume {key}: stored version {stored} is newer than {assumed}")]
    AssumeOutdated {
        key: ObjectKey,
        stored: ResourceVersion,
        assumed: ResourceVersion,
    },

    #[error("resource claim {key} is in the process of being allocated")]
    AllocationInFlight { key: ObjectKey },

    #[error("device {device} for resource claim {key} is being allocated to claim {holder}")]
    DeviceInFlight {
        key: ObjectKey,
        device: DeviceId,
        holder: ObjectKey,
    },

    #[error("device {device} for resource claim {key} is already allocated to claim {holder}")]
    DeviceAllocated {
        key: ObjectKey,
        device: DeviceId,
        holder: ObjectKey,
    },

    #[error("control plane context {key} is not owned by workload with uid {uid}")]
    ForeignContext { key: ObjectKey, uid: String },

    #[error("control plane context {key} is being deleted")]
    ContextBeingDeleted { key: ObjectKey },

    #[error("unexpected object in {handler}: expected {expected}, got {got}")]
    UnexpectedObject {
        handler: &'static str,
        expected: &'static str,
        got: &'static str,
    },
}

impl CoordinatorError {
    /// Whether the error is an optimistic-concurrency version mismatch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoordinatorError::State(e) if e.is_conflict())
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
