//! Explicit identity tags for repositories and migrated entities.
//!
//! # Responsibility
//! - Key the repository registry by a repository-supplied tag.
//! - Key patch catalogues by the entity namespace a repository owns.
//!
//! # Invariants
//! - Tags are compile-time strings; two repositories sharing a tag are the
//!   same registry slot.

use std::fmt::{Display, Formatter};

/// Registry key for one concrete repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepositoryTag(&'static str);

impl RepositoryTag {
    pub const fn new(value: &'static str) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Display for RepositoryTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Patch catalogue key for one entity namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityTag(&'static str);

impl EntityTag {
    pub const fn new(value: &'static str) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Display for EntityTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}
