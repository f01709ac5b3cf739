//! Repository lifecycle contracts and the process registry.
//!
//! # Responsibility
//! - Define the lifecycle every persistent store follows:
//!   initialize, register patches, execute patches, close.
//! - Coordinate that lifecycle over all registered repositories.
//! - Hand started repositories to the host through a `DataProxy`.
//!
//! # Invariants
//! - A repository owns its connection exclusively.
//! - Data access on a repository that is not valid fails with
//!   `StoreError::InvalidState`.
//! - `close` is terminal and idempotent.

use crate::compat::{CompatError, CompatibilityService};
use crate::context::{Context, InitContext};
use crate::db::StoreError;
use crate::patch::PatchError;
use crate::tag::RepositoryTag;
use async_trait::async_trait;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod proxy;
pub mod registry;

pub type RepoResult<T> = Result<T, RepoError>;

/// Error surfaced by repository lifecycle operations.
#[derive(Debug)]
pub enum RepoError {
    Store(StoreError),
    Patch(PatchError),
    Compat(CompatError),
    /// Repository-specific failure outside the backend.
    Other(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Patch(err) => write!(f, "{err}"),
            Self::Compat(err) => write!(f, "{err}"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Patch(err) => Some(err),
            Self::Compat(err) => Some(err),
            Self::Other(_) => None,
        }
    }
}

impl From<StoreError> for RepoError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<PatchError> for RepoError {
    fn from(value: PatchError) -> Self {
        Self::Patch(value)
    }
}

impl From<CompatError> for RepoError {
    fn from(value: CompatError) -> Self {
        Self::Compat(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(value))
    }
}

/// Type-erased access used by `RepositoryRegistry::resolve`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One persistent store with its own connection.
///
/// Implementations are not thread-safe; the registry drives them one call
/// at a time.
#[async_trait]
pub trait Repository: AsAny + Send {
    /// Registry key; at most one repository per tag.
    fn tag(&self) -> RepositoryTag;

    /// True iff the connection is open and passed its validation probe.
    fn is_valid(&self) -> bool;

    /// Opens backing resources and validates them.
    ///
    /// Implementations call `ctx.login_failed()` when the failure is an
    /// authentication failure, and must leave `is_valid() == false` on error.
    async fn initialize(&mut self, ctx: &InitContext<'_>) -> RepoResult<()>;

    /// Contributes this repository's patches to `compat`.
    fn register_patches(&mut self, ctx: &dyn Context, compat: &mut CompatibilityService);

    /// Runs the outstanding patches of every entity this repository owns.
    async fn execute_patches(
        &mut self,
        ctx: &dyn Context,
        compat: &mut CompatibilityService,
    ) -> RepoResult<()>;

    /// Releases the connection; idempotent.
    async fn close(&mut self) -> RepoResult<()>;
}
