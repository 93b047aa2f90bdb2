//! ClaimGrid structured allocator: device predicates, node selectors,
//! backtracking device assignment.
//!
//! This crate decides whether the devices reachable from one node can
//! satisfy a set of resource claims. It does NOT touch the object store or
//! the claim caches (that's `claimgrid-scheduler`). Callers hand it claims,
//! classes and slices and get back allocation results.
//!
//! # Components
//!
//! - **`predicate`**: Device predicate expressions (compile once, evaluate per device)
//! - **`selector`**: Node selector matching for allocation constraints
//! - **`inventory`**: Per-node device view built from resource slices
//! - **`allocator`**: Exclusive device assignment via depth-first search

pub mod allocator;
pub mod error;
pub mod inventory;
pub mod predicate;
pub mod selector;

pub use allocator::Allocator;
pub use error::{AllocatorError, AllocatorResult, CompileError, EvalError, SelectorOwner};
pub use inventory::{InventoryDevice, NodeInventory};
pub use predicate::{DeviceView, Predicate};
pub use selector::{allocation_available_on, node_matches};
