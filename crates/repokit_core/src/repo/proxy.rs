//! Host-facing access point over a started set of repositories.
//!
//! # Responsibility
//! - Start the registry, then the provider-wide patcher, then advance the
//!   last used version.
//! - Hand out repositories only when they are valid and their data has
//!   reached the version the caller requires.
//! - Expose the provider's patcher and authenticator.
//!
//! # Invariants
//! - The last used version advances only after every repository and the
//!   provider patcher succeeded.
//! - `request` never returns a repository that is not valid.

use super::registry::RepositoryRegistry;
use super::{RepoResult, Repository};
use crate::compat::CompatibilityService;
use crate::context::Context;
use crate::db::Authenticator;
use crate::tag::RepositoryTag;
use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Registers and runs patches that belong to the data provider as a whole
/// rather than to one repository.
#[async_trait]
pub trait DataProviderPatcher: Send + Sync {
    fn register_patches(&self, ctx: &dyn Context, compat: &mut CompatibilityService);

    async fn execute_patches(
        &self,
        ctx: &dyn Context,
        compat: &mut CompatibilityService,
    ) -> RepoResult<()>;
}

/// Requirements a caller places on a requested repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyParameter {
    /// Lowest last used version the repository's data must have reached.
    pub minimum_version: u32,
}

impl ProxyParameter {
    pub fn new(minimum_version: u32) -> Self {
        Self { minimum_version }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// No repository of the requested type is registered.
    NotRegistered(&'static str),
    /// The repository exists but is not valid.
    NotReady(RepositoryTag),
    VersionTooLow { required: u32, available: u32 },
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered(name) => {
                write!(f, "no repository registered for type {name}")
            }
            Self::NotReady(tag) => write!(f, "repository {tag} is not valid"),
            Self::VersionTooLow {
                required,
                available,
            } => write!(
                f,
                "data version {available} is below required version {required}"
            ),
        }
    }
}

impl Error for ProxyError {}

/// Retrieves data stores for the host.
pub trait DataProxy {
    /// Returns the repository of type `T` if it satisfies `parameter`.
    ///
    /// # Errors
    /// - `NotRegistered` when no repository of type `T` exists.
    /// - `NotReady` when it is not valid.
    /// - `VersionTooLow` when the data is older than `minimum_version`.
    fn request<T: Repository>(&self, parameter: &ProxyParameter) -> Result<&T, ProxyError>;

    fn request_patcher(&self) -> &dyn DataProviderPatcher;

    fn request_authenticator(&self) -> &dyn Authenticator;
}

/// `DataProxy` backed by a `RepositoryRegistry` and one compatibility service.
pub struct RegistryProxy {
    registry: RepositoryRegistry,
    compat: CompatibilityService,
    patcher: Box<dyn DataProviderPatcher>,
    authenticator: Box<dyn Authenticator>,
    patcher_registered: bool,
}

impl RegistryProxy {
    pub fn new(
        registry: RepositoryRegistry,
        compat: CompatibilityService,
        patcher: impl DataProviderPatcher + 'static,
        authenticator: impl Authenticator + 'static,
    ) -> Self {
        Self {
            registry,
            compat,
            patcher: Box::new(patcher),
            authenticator: Box::new(authenticator),
            patcher_registered: false,
        }
    }

    pub fn registry(&self) -> &RepositoryRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RepositoryRegistry {
        &mut self.registry
    }

    pub fn compat(&self) -> &CompatibilityService {
        &self.compat
    }

    /// Initializes every repository, runs the provider patches and, when all
    /// succeeded, records the current version as the last used one.
    ///
    /// Safe to retry after a failure; applied patch steps are not re-run.
    pub async fn start(
        &mut self,
        ctx: &dyn Context,
        on_login_failed: &(dyn Fn() + Send + Sync),
    ) -> bool {
        let started_at = Instant::now();
        if !self
            .registry
            .initialize_all(ctx, &mut self.compat, on_login_failed)
            .await
        {
            warn!("event=proxy_start module=proxy status=error stage=repositories");
            return false;
        }

        if !self.patcher_registered {
            self.patcher.register_patches(ctx, &mut self.compat);
            self.patcher_registered = true;
        }
        if let Err(err) = self.patcher.execute_patches(ctx, &mut self.compat).await {
            error!("event=proxy_start module=proxy status=error stage=provider_patches error={err}");
            ctx.log_error(&err);
            return false;
        }

        if self.compat.update_last_used_version(ctx).is_err() {
            return false;
        }

        info!(
            "event=proxy_start module=proxy status=ok version={} duration_ms={}",
            self.compat.last_used_version(),
            started_at.elapsed().as_millis()
        );
        true
    }

    /// Closes and drains every repository.
    pub async fn shutdown(&mut self, ctx: &dyn Context) {
        self.registry.close_all(ctx).await;
    }
}

impl DataProxy for RegistryProxy {
    fn request<T: Repository>(&self, parameter: &ProxyParameter) -> Result<&T, ProxyError> {
        let repository = self
            .registry
            .resolve::<T>()
            .ok_or(ProxyError::NotRegistered(type_name::<T>()))?;
        if !repository.is_valid() {
            return Err(ProxyError::NotReady(repository.tag()));
        }

        let available = self.compat.last_used_version();
        if available < parameter.minimum_version {
            return Err(ProxyError::VersionTooLow {
                required: parameter.minimum_version,
                available,
            });
        }
        Ok(repository)
    }

    fn request_patcher(&self) -> &dyn DataProviderPatcher {
        self.patcher.as_ref()
    }

    fn request_authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }
}
