//! Repository lifecycle and version-patch engine.
//!
//! Registers encrypted SQLite-backed repositories, brings them into a valid
//! state, runs their versioned patches and closes them again.

pub mod compat;
pub mod context;
pub mod db;
pub mod logging;
pub mod patch;
pub mod repo;
pub mod tag;

pub use compat::{
    CompatError, CompatibilityService, MemoryVersionSource, SqliteVersionSource, VersionSource,
};
pub use context::{Context, InitContext, LogContext};
pub use db::{
    is_integrity_ok, AuditAction, AuditCommand, Authenticator, ConnectionDescriptor, DbResult,
    IntegrityValidator, SqliteAuthenticator, SqliteIntegrityValidator, SqliteStore, StoreError,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig};
pub use patch::{PatchError, PatchStep, StepError, StepFuture, StepResult, VersionPatch};
pub use repo::proxy::{DataProviderPatcher, DataProxy, ProxyError, ProxyParameter, RegistryProxy};
pub use repo::registry::{RegistryError, RepositoryRegistry};
pub use repo::{RepoError, RepoResult, Repository};
pub use tag::{EntityTag, RepositoryTag};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
