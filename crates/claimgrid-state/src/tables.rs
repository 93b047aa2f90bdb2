//! redb table definitions for the ClaimGrid object store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Namespaced kinds are keyed by `{namespace}/{name}`, cluster-scoped kinds
//! by `{name}`.

use redb::TableDefinition;

/// Resource claims keyed by `{namespace}/{name}`.
pub const CLAIMS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_claims");

/// Device classes keyed by `{name}`.
pub const CLASSES: TableDefinition<&str, &[u8]> = TableDefinition::new("device_classes");

/// Resource slices keyed by `{name}`.
pub const SLICES: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_slices");

/// Control-plane contexts keyed by `{namespace}/{name}`.
pub const CONTEXTS: TableDefinition<&str, &[u8]> = TableDefinition::new("control_plane_contexts");

/// Store-wide counters (`resource_version`, `uid`).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

pub const RESOURCE_VERSION_COUNTER: &str = "resource_version";
pub const UID_COUNTER: &str = "uid";
