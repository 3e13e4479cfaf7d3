//! Identities for workers and packages.
//!
//! A worker is one OS thread in the pool; a package is a group of workers
//! sharing a cache level. Both are dense indices assigned by the pool at
//! construction, wrapped in newtypes so the two index spaces cannot be mixed
//! up in escalation arithmetic.

use std::fmt;

// ---------------------------------------------------------------------------
// WorkerId
// ---------------------------------------------------------------------------

/// Dense index of a worker thread within the pool, `0..threads`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Wrap a raw pool index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// The raw pool index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PackageId
// ---------------------------------------------------------------------------

/// Dense index of a package (a cache-sharing group of workers), `0..packages`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(usize);

impl PackageId {
    /// Wrap a raw package index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// The raw package index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageId({})", self.0)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg{}", self.0)
    }
}
