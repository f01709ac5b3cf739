//! Per-entity patch catalogues and schema version bookkeeping.
//!
//! # Responsibility
//! - Collect `VersionPatch`es per entity.
//! - Yield the patches newer than the last used version, in version order.
//! - Advance the durable last used version once the host finished startup.
//!
//! # Invariants
//! - Patches at or below `last_used_version` are never yielded.
//! - Patches above `current_version` are yielded; registering them is a
//!   caller bug and is logged as a warning.
//! - Each entity list stays sorted by version; equal versions keep their
//!   registration order.
//! - A contributor registers its patches at most once per service.

use crate::context::Context;
use crate::db::StoreError;
use crate::patch::{PatchError, VersionPatch};
use crate::tag::{EntityTag, RepositoryTag};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

mod sqlite_versions;

pub use sqlite_versions::SqliteVersionSource;

#[derive(Debug)]
pub enum CompatError {
    Store(StoreError),
    /// The version does not fit the backing store's integer range.
    VersionTooLarge(u32),
    /// The backing store holds a value that is not a valid version.
    InvalidStoredVersion(i64),
}

impl Display for CompatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::VersionTooLarge(version) => {
                write!(f, "version {version} cannot be persisted")
            }
            Self::InvalidStoredVersion(value) => {
                write!(f, "stored version {value} is not a valid version")
            }
        }
    }
}

impl Error for CompatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::VersionTooLarge(_) | Self::InvalidStoredVersion(_) => None,
        }
    }
}

impl From<StoreError> for CompatError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for CompatError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(value))
    }
}

/// Host-provided version numbers.
pub trait VersionSource: Send + Sync {
    /// Schema version the running binary is built against.
    fn current_version(&self) -> u32;

    /// Durable version recorded by the last completed startup.
    fn last_used_version(&self) -> u32;

    /// Durably records `version` as the last used version.
    fn store_last_used_version(&self, version: u32) -> Result<(), CompatError>;
}

/// In-process version source; nothing survives the process.
#[derive(Debug)]
pub struct MemoryVersionSource {
    current: u32,
    last_used: AtomicU32,
}

impl MemoryVersionSource {
    pub fn new(current: u32, last_used: u32) -> Self {
        Self {
            current,
            last_used: AtomicU32::new(last_used),
        }
    }
}

impl VersionSource for MemoryVersionSource {
    fn current_version(&self) -> u32 {
        self.current
    }

    fn last_used_version(&self) -> u32 {
        self.last_used.load(Ordering::SeqCst)
    }

    fn store_last_used_version(&self, version: u32) -> Result<(), CompatError> {
        self.last_used.store(version, Ordering::SeqCst);
        Ok(())
    }
}

/// Patch registry and version gate shared by all repositories.
pub struct CompatibilityService {
    catalogue: BTreeMap<EntityTag, Vec<VersionPatch>>,
    contributors: BTreeSet<RepositoryTag>,
    versions: Box<dyn VersionSource>,
}

impl CompatibilityService {
    pub fn new(versions: impl VersionSource + 'static) -> Self {
        Self {
            catalogue: BTreeMap::new(),
            contributors: BTreeSet::new(),
            versions: Box::new(versions),
        }
    }

    pub fn current_version(&self) -> u32 {
        self.versions.current_version()
    }

    pub fn last_used_version(&self) -> u32 {
        self.versions.last_used_version()
    }

    /// Adds `patch` to `entity`'s catalogue after every patch with a lower or
    /// equal version.
    pub fn register_patch(&mut self, entity: EntityTag, patch: VersionPatch) {
        let patches = self.catalogue.entry(entity).or_default();
        let position = patches.partition_point(|existing| existing.version() <= patch.version());
        patches.insert(position, patch);
    }

    /// Records `contributor` as having registered its patches here.
    ///
    /// Returns false when it already had; its patches, and their applied
    /// steps, are then already in the catalogue.
    pub fn mark_registered(&mut self, contributor: RepositoryTag) -> bool {
        self.contributors.insert(contributor)
    }

    pub fn is_registered(&self, contributor: RepositoryTag) -> bool {
        self.contributors.contains(&contributor)
    }

    pub fn has_patches(&self, entity: EntityTag) -> bool {
        self.catalogue
            .get(&entity)
            .is_some_and(|patches| !patches.is_empty())
    }

    /// Yields `entity`'s patches newer than the last used version.
    ///
    /// Logs a notice when the entity has no registered patches.
    pub fn patches_for<'a>(
        &'a mut self,
        ctx: &'a dyn Context,
        entity: EntityTag,
    ) -> impl Iterator<Item = &'a mut VersionPatch> + 'a {
        let from = self.versions.last_used_version();
        let current = self.versions.current_version();
        let patches = self.catalogue.get_mut(&entity);
        if patches.is_none() {
            ctx.log(&format!("No patches available for entity=[{entity}]"));
        }

        patches
            .into_iter()
            .flat_map(|patches| patches.iter_mut())
            .filter(move |patch| patch.version() > from)
            .inspect(move |patch| {
                let version = patch.version();
                ctx.log(&format!("patch version={version}, from={from}, for={entity}"));
                if version > current {
                    warn!(
                        "event=patch_discovery module=compat status=ahead entity={entity} version={version} current={current}"
                    );
                }
            })
    }

    /// Runs every pending patch of `entity` in order and returns how many
    /// were run. Stops at the first failing patch.
    ///
    /// # Errors
    /// Returns the failing patch's `PatchError`.
    pub async fn execute_pending(
        &mut self,
        ctx: &dyn Context,
        entity: EntityTag,
    ) -> Result<usize, PatchError> {
        let mut executed = 0;
        for patch in self.patches_for(ctx, entity) {
            patch.patch(ctx).await?;
            executed += 1;
        }
        info!("event=patch_execute module=compat status=ok entity={entity} executed={executed}");
        Ok(executed)
    }

    /// Records the current version as the last used one.
    ///
    /// Call only after every repository initialized successfully.
    ///
    /// # Errors
    /// Returns the version source's persistence error.
    pub fn update_last_used_version(&self, ctx: &dyn Context) -> Result<(), CompatError> {
        let from = self.versions.last_used_version();
        let current = self.versions.current_version();
        match self.versions.store_last_used_version(current) {
            Ok(()) => {
                info!("event=version_update module=compat status=ok from={from} to={current}");
                Ok(())
            }
            Err(err) => {
                ctx.log_error(&err);
                Err(err)
            }
        }
    }
}
