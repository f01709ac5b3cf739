//! Connection bootstrap for cipher-keyed SQLite files.
//!
//! # Responsibility
//! - Open file or in-memory connections described by `ConnectionDescriptor`.
//! - Apply the cipher key before any other statement touches the file.
//! - Configure connection pragmas.
//!
//! # Invariants
//! - The key pragma is the first statement executed on a new connection.
//! - Opening never reports a wrong cipher by itself; the first real statement
//!   does, so callers must probe the connection afterwards.

use super::DbResult;
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Path selecting a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Where and how a repository's database is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDescriptor {
    pub path: PathBuf,
    pub cipher: Option<String>,
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
    pub create_if_missing: bool,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
            cipher: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            foreign_keys: true,
            create_if_missing: true,
        }
    }
}

impl ConnectionDescriptor {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_cipher(mut self, cipher: impl Into<String>) -> Self {
        self.cipher = Some(cipher.into());
        self
    }

    pub fn existing_only(mut self) -> Self {
        self.create_if_missing = false;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.path == Path::new(MEMORY_PATH)
    }

    /// True when opening will create a new, empty database.
    pub(crate) fn is_fresh(&self) -> bool {
        self.is_memory() || (self.create_if_missing && !self.path.exists())
    }

    fn mode(&self) -> &'static str {
        if self.is_memory() {
            "memory"
        } else {
            "file"
        }
    }

    fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

/// Opens and configures a connection for `descriptor`.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_connection(descriptor: &ConnectionDescriptor) -> DbResult<Connection> {
    let started_at = Instant::now();
    let mode = descriptor.mode();
    info!("event=db_open module=db status=start mode={mode}");

    let conn = match Connection::open_with_flags(&descriptor.path, descriptor.open_flags()) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&conn, descriptor) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={}",
                mode,
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err.into())
        }
    }
}

fn bootstrap_connection(
    conn: &Connection,
    descriptor: &ConnectionDescriptor,
) -> rusqlite::Result<()> {
    if let Some(cipher) = descriptor.cipher.as_deref() {
        apply_key(conn, cipher)?;
    }
    conn.busy_timeout(Duration::from_millis(descriptor.busy_timeout_ms))?;
    if descriptor.foreign_keys {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }
    Ok(())
}

// SQLCipher answers `PRAGMA key` with a status row; plain SQLite ignores it.
fn apply_key(conn: &Connection, cipher: &str) -> rusqlite::Result<()> {
    let sql = format!("PRAGMA key = {};", quote_literal(cipher));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::{open_connection, quote_literal, ConnectionDescriptor};

    #[test]
    fn quote_literal_escapes_single_quotes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn descriptor_defaults_to_memory() {
        let descriptor = ConnectionDescriptor::default();
        assert!(descriptor.is_memory());
        assert!(descriptor.is_fresh());
        assert!(descriptor.foreign_keys);
    }

    #[test]
    fn descriptor_deserializes_partial_config() {
        let descriptor: ConnectionDescriptor =
            serde_json::from_str(r#"{"path":"/data/notes.db","cipher":"s3cret"}"#).unwrap();
        assert_eq!(descriptor.cipher.as_deref(), Some("s3cret"));
        assert_eq!(descriptor.busy_timeout_ms, 5_000);
        assert!(descriptor.create_if_missing);
        assert!(!descriptor.is_memory());
    }

    #[test]
    fn opens_keyed_in_memory_connection_with_foreign_keys() {
        let conn = open_connection(&ConnectionDescriptor::in_memory().with_cipher("k")).unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn existing_only_refuses_to_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ConnectionDescriptor::file(dir.path().join("absent.db")).existing_only();
        assert!(!descriptor.is_fresh());
        assert!(open_connection(&descriptor).is_err());
    }
}
