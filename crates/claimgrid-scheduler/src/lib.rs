//! claimgrid-scheduler: resource claim coordination for a multi-phase
//! scheduling pipeline.
//!
//! The host pipeline drives a workload through PreEnqueue, PreFilter,
//! Filter, PostFilter, PreScore, Reserve, Unreserve, PreBind and PostBind.
//! [`ClaimCoordinator`] answers each phase with a [`Status`], and decides
//! from store change notifications whether a rejected workload is worth
//! another attempt ([`QueueingHint`]).
//!
//! # Architecture
//!
//! ```text
//! ClaimCoordinator
//!   ├── StateStore (claims, classes, slices, contexts; CAS writes)
//!   ├── AssumeCache<ResourceClaim> (store mirror + speculative overlays)
//!   ├── InFlightAllocations (claim uid → allocation between Reserve and PreBind)
//!   └── per attempt: CycleState
//!       ├── Allocator (compiled selectors, per-node device search)
//!       └── HandshakeState (pending ControlPlaneContext changes)
//! ```

pub mod assume_cache;
pub mod config;
pub mod coordinator;
pub mod cycle_state;
pub mod error;
pub mod handshake;
pub mod in_flight;
pub mod requeue;
mod resolve;
pub mod status;

pub use assume_cache::AssumeCache;
pub use config::CoordinatorConfig;
pub use coordinator::ClaimCoordinator;
pub use cycle_state::{ClaimEntry, CycleState};
pub use error::{CoordinatorError, CoordinatorResult};
pub use handshake::HandshakeState;
pub use in_flight::{InFlightAllocations, InFlightConflict, InFlightEntry};
pub use requeue::{EventRegistration, WatchedKind};
pub use status::{Code, QueueingHint, Status};

pub use tokio_util::sync::CancellationToken;
