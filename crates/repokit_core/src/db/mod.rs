//! Embedded SQL backend for repositories.
//!
//! # Responsibility
//! - Open cipher-keyed SQLite connections from a `ConnectionDescriptor`.
//! - Provide the shared repository adapter (`SqliteStore`): lazy open,
//!   `META` validation probe, audited transactions, integrity probe, close.
//! - Provide the authenticator and integrity validator contracts.
//!
//! # Invariants
//! - A store refuses data access while it is not valid.
//! - A bad cipher found while opening or probing a connection is reported as
//!   `AuthenticationFailed`, never as a generic backend error. Once a
//!   connection is unlocked, `SQLITE_NOTADB` means damaged pages and stays a
//!   backend error.

use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod audit;
pub mod auth;
pub mod integrity;
mod open;
mod store;

pub use audit::{AuditAction, AuditCommand};
pub use auth::{Authenticator, SqliteAuthenticator};
pub use integrity::{is_integrity_ok, IntegrityValidator, SqliteIntegrityValidator};
pub use open::{open_connection, ConnectionDescriptor, MEMORY_PATH};
pub use store::{SqliteStore, META_TABLE};

pub type DbResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// Data access attempted while the store is not valid.
    InvalidState,
    AuthenticationFailed,
    MissingMetaTable,
    /// The store was closed and cannot be reopened.
    Closed,
    IntegrityFailed(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::InvalidState => write!(f, "database is not in a valid state"),
            Self::AuthenticationFailed => {
                write!(f, "cipher does not unlock the database")
            }
            Self::MissingMetaTable => write!(f, "database has no META table"),
            Self::Closed => write!(f, "database store is closed"),
            Self::IntegrityFailed(result) => {
                write!(f, "database integrity check failed: {result}")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl StoreError {
    /// Reclassifies a failure raised while unlocking a connection.
    pub(crate) fn classify_unlock(self) -> Self {
        match self {
            Self::Sqlite(err) if is_not_a_database(&err) => Self::AuthenticationFailed,
            other => other,
        }
    }
}

/// SQLite reports a wrong cipher (or a non-database file) as `SQLITE_NOTADB`,
/// and only once a statement touches the file.
fn is_not_a_database(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::NotADatabase
    )
}
