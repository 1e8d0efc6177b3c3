//! Aggregate version numbers for optimistic concurrency control.
//!
//! Every aggregate carries a monotonic version that increments on each
//! committed mutation. Persistence compares the expected version against the
//! stored one at commit time; a mismatch means another writer got there
//! first and surfaces as a conflict to be retried.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A monotonic aggregate version.
///
/// Versions start at 0 for a freshly created aggregate and increase by 1 on
/// every mutation. Reaching `u64::MAX` is not a realistic concern for any
/// aggregate lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly created aggregate.
    pub const INITIAL: Self = Self(0);

    /// Construct from a raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the initial version.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}
