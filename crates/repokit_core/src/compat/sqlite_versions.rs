//! Durable last-used version kept in a SQLite file's `PRAGMA user_version`.

use super::{CompatError, VersionSource};
use crate::db::{open_connection, ConnectionDescriptor};
use log::{error, info};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Version source backed by `PRAGMA user_version` of a settings database.
///
/// The stored value is read once on open and cached; writes go through to
/// the file before the cache is updated.
pub struct SqliteVersionSource {
    current: u32,
    last_used: AtomicU32,
    conn: Mutex<Connection>,
}

impl SqliteVersionSource {
    /// Opens `descriptor` and loads the stored version.
    ///
    /// # Errors
    /// - The backend error when the file cannot be opened or read.
    /// - `InvalidStoredVersion` when the file holds a negative version.
    pub fn open(descriptor: &ConnectionDescriptor, current: u32) -> Result<Self, CompatError> {
        let conn = open_connection(descriptor)?;
        let stored = read_user_version(&conn)?;
        info!("event=version_load module=compat status=ok stored={stored} current={current}");
        Ok(Self {
            current,
            last_used: AtomicU32::new(stored),
            conn: Mutex::new(conn),
        })
    }
}

impl VersionSource for SqliteVersionSource {
    fn current_version(&self) -> u32 {
        self.current
    }

    fn last_used_version(&self) -> u32 {
        self.last_used.load(Ordering::SeqCst)
    }

    fn store_last_used_version(&self, version: u32) -> Result<(), CompatError> {
        // user_version is a signed 32-bit integer.
        let value = i32::try_from(version).map_err(|_| CompatError::VersionTooLarge(version))?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.pragma_update(None, "user_version", value)?;
        self.last_used.store(version, Ordering::SeqCst);
        Ok(())
    }
}

fn read_user_version(conn: &Connection) -> Result<u32, CompatError> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, i64>(0))?;
    u32::try_from(version).map_err(|_| {
        error!("event=version_load module=compat status=error stored={version}");
        CompatError::InvalidStoredVersion(version)
    })
}
