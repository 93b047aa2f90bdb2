//! claimgrid-state: object model and versioned object store for ClaimGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for resource claims, device classes, resource slices and
//! control-plane contexts.
//!
//! # Architecture
//!
//! All objects are JSON-serialized into redb's `&[u8]` value columns, one
//! table per object kind, keyed by `{namespace}/{name}` (or just `{name}`
//! for cluster-scoped kinds).
//!
//! Every stored object carries a [`ResourceVersion`]. Updates are
//! compare-and-swap: the caller presents the version it read, and the
//! store rejects the write with [`StateError::Conflict`] if the object has
//! moved on since. Successful writes are fanned out to subscribed
//! [`ChangeHandler`]s as `(old, new)` pairs.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod version;
pub mod watch;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
pub use version::ResourceVersion;
pub use watch::{ChangeAction, ChangeEvent, ChangeHandler, WatchedObject};
