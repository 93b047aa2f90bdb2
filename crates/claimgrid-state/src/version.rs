//! Opaque version tokens used for optimistic concurrency.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version token of a stored object.
///
/// Assigned by the store on every successful write from a single
/// monotonically increasing counter, so tokens of the same object can be
/// ordered. The zero value means "never stored".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    pub const UNSET: ResourceVersion = ResourceVersion(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// True if `self` was written after `other`.
    pub fn is_newer_than(self, other: ResourceVersion) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceVersion {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ResourceVersion)
    }
}
