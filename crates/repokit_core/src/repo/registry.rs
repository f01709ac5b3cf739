//! Process registry driving repository startup and shutdown.
//!
//! # Responsibility
//! - Hold at most one repository per tag, in insertion order.
//! - Initialize, patch and close the registered repositories.
//!
//! # Invariants
//! - Duplicate tags are rejected; the first registration wins.
//! - `initialize_all` stops at the first failing repository.
//! - `close_all` attempts every repository exactly once, whatever fails, and
//!   drains the registry.
//! - `register_patches` runs at most once per repository and compatibility
//!   service, even when `initialize_all` is retried.
//!
//! Not safe for concurrent lifecycle calls; callers serialize them.

use super::{RepoResult, Repository};
use crate::compat::CompatibilityService;
use crate::context::{Context, InitContext};
use crate::tag::RepositoryTag;
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateRepository(RepositoryTag),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRepository(tag) => {
                write!(f, "repository already registered: {tag}")
            }
        }
    }
}

impl Error for RegistryError {}

struct Entry {
    tag: RepositoryTag,
    repository: Box<dyn Repository>,
}

/// Ordered set of live repositories keyed by tag.
#[derive(Default)]
pub struct RepositoryRegistry {
    entries: Vec<Entry>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `repository`, logging and dropping it when its tag is taken.
    pub fn register(&mut self, ctx: &dyn Context, repository: impl Repository) {
        if let Err(err) = self.try_register(Box::new(repository)) {
            warn!("event=repo_register module=registry status=error error={err}");
            ctx.log_error(&err);
        }
    }

    /// Registers `repository` under its tag.
    ///
    /// # Errors
    /// Returns `DuplicateRepository` when the tag is already registered; the
    /// registry keeps the first instance.
    pub fn try_register(&mut self, repository: Box<dyn Repository>) -> Result<(), RegistryError> {
        let tag = repository.tag();
        if self.contains(tag) {
            return Err(RegistryError::DuplicateRepository(tag));
        }

        info!("event=repo_register module=registry status=ok tag={tag}");
        self.entries.push(Entry { tag, repository });
        Ok(())
    }

    pub fn contains(&self, tag: RepositoryTag) -> bool {
        self.entries.iter().any(|entry| entry.tag == tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tags in registration order.
    pub fn tags(&self) -> Vec<RepositoryTag> {
        self.entries.iter().map(|entry| entry.tag).collect()
    }

    /// Returns the first registered repository of concrete type `T`.
    pub fn resolve<T: Repository>(&self) -> Option<&T> {
        self.entries.iter().find_map(|entry| {
            let repository: &dyn Repository = entry.repository.as_ref();
            repository.as_any().downcast_ref::<T>()
        })
    }

    pub fn resolve_mut<T: Repository>(&mut self) -> Option<&mut T> {
        self.entries.iter_mut().find_map(|entry| {
            let repository: &mut dyn Repository = entry.repository.as_mut();
            repository.as_any_mut().downcast_mut::<T>()
        })
    }

    /// Initializes, patches and validates every repository in order.
    ///
    /// Returns `false` as soon as one repository fails; later repositories are
    /// left untouched. `on_login_failed` is reachable by repositories through
    /// `InitContext::login_failed`.
    pub async fn initialize_all(
        &mut self,
        ctx: &dyn Context,
        compat: &mut CompatibilityService,
        on_login_failed: &(dyn Fn() + Send + Sync),
    ) -> bool {
        let started_at = Instant::now();
        let init_ctx = InitContext::new(ctx, on_login_failed);

        for entry in &mut self.entries {
            let tag = entry.tag;
            if let Err(err) = initialize_entry(entry, &init_ctx, compat).await {
                error!(
                    "event=repo_init module=registry status=error tag={} duration_ms={} error={}",
                    tag,
                    started_at.elapsed().as_millis(),
                    err
                );
                ctx.log(&format!("Unable to initialize repository=[{tag}]"));
                ctx.log_error(&err);
                return false;
            }
            info!("event=repo_init module=registry status=ok tag={tag}");
        }

        info!(
            "event=repo_init_all module=registry status=ok count={} duration_ms={}",
            self.entries.len(),
            started_at.elapsed().as_millis()
        );
        true
    }

    /// Closes every repository, logging individual failures, and removes
    /// them from the registry.
    pub async fn close_all(&mut self, ctx: &dyn Context) {
        if self.entries.is_empty() {
            return;
        }

        let count = self.entries.len();
        let mut failures = 0usize;
        for mut entry in self.entries.drain(..) {
            if let Err(err) = entry.repository.close().await {
                failures += 1;
                warn!(
                    "event=repo_close module=registry status=error tag={} error={}",
                    entry.tag, err
                );
                ctx.log(&format!("Unable to close repository=[{}]", entry.tag));
                ctx.log_error(&err);
            }
        }
        info!("event=repo_close_all module=registry status=ok count={count} failures={failures}");
    }

    /// Drops every entry without closing it.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

async fn initialize_entry(
    entry: &mut Entry,
    ctx: &InitContext<'_>,
    compat: &mut CompatibilityService,
) -> RepoResult<()> {
    entry.repository.initialize(ctx).await?;
    if compat.mark_registered(entry.tag) {
        entry.repository.register_patches(ctx, compat);
    }
    entry.repository.execute_patches(ctx, compat).await
}
