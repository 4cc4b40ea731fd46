use serde::{Deserialize, Serialize};

/// Revision of a saga instance, used to detect concurrent writes.
///
/// A freshly created, never persisted instance is at revision 0. Every
/// successful save increments the revision by exactly one, so the first
/// persisted revision is 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// Creates a revision from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the revision (0) of an instance that was never saved.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next revision.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw revision value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Revision {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Revision> for i64 {
    fn from(revision: Revision) -> Self {
        revision.0
    }
}
