//! Cipher authentication against database files.

use super::open::{open_connection, ConnectionDescriptor};
use super::StoreError;
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Checks whether a cipher unlocks a database.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticates against the implementation's default database.
    async fn authenticate(&self, cipher: &str) -> bool;

    /// Authenticates against the database at `db_path`.
    async fn authenticate_at(&self, cipher: &str, db_path: &Path) -> bool;
}

/// Authenticator for SQLite files; never creates a missing file.
#[derive(Debug, Clone)]
pub struct SqliteAuthenticator {
    default_path: PathBuf,
}

impl SqliteAuthenticator {
    pub fn new(default_path: impl Into<PathBuf>) -> Self {
        Self {
            default_path: default_path.into(),
        }
    }

    fn probe(cipher: &str, db_path: &Path) -> Result<(), StoreError> {
        let descriptor = ConnectionDescriptor::file(db_path)
            .with_cipher(cipher)
            .existing_only();
        let conn = open_connection(&descriptor).map_err(StoreError::classify_unlock)?;
        // A bad cipher only surfaces once a statement reads the file.
        conn.query_row("SELECT count(*) FROM sqlite_master;", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|err| StoreError::classify_unlock(err.into()))?;
        Ok(())
    }
}

#[async_trait]
impl Authenticator for SqliteAuthenticator {
    async fn authenticate(&self, cipher: &str) -> bool {
        self.authenticate_at(cipher, &self.default_path).await
    }

    async fn authenticate_at(&self, cipher: &str, db_path: &Path) -> bool {
        match Self::probe(cipher, db_path) {
            Ok(()) => {
                info!("event=db_authenticate module=db status=ok");
                true
            }
            Err(err) => {
                warn!("event=db_authenticate module=db status=error error={err}");
                false
            }
        }
    }
}
