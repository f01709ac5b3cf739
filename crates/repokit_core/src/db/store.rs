//! Shared SQLite adapter for concrete repositories.
//!
//! # Responsibility
//! - Own exactly one connection per repository, opened lazily on first use.
//! - Gate validity on the `META` table probe.
//! - Offer audited transactional execution, integrity probing and SQL patch
//!   steps built on the same connection.
//!
//! # Invariants
//! - `valid` is true only after the probe succeeded and until `close`.
//! - Data access while not valid fails with `StoreError::InvalidState`.
//! - `close` is idempotent; a closed store never reopens.
//! - The internal lock is never held across an `.await`.
//! - The lock is re-entrant: an action running under `audit` or
//!   `with_connection` may call back into the same store (or a clone) on the
//!   same thread and joins the open transaction.
//! - A wrong cipher is classified as `AuthenticationFailed` only while opening
//!   and probing; later `SQLITE_NOTADB` failures stay backend errors.
//!
//! Clones share one connection and one lock. Other threads are serialized,
//! which does not make interleaved transactions safe.

use super::audit::{audit_all_on, audit_on, in_scope, AuditAction, AuditCommand};
use super::integrity::is_integrity_ok;
use super::open::{open_connection, ConnectionDescriptor};
use super::{DbResult, StoreError};
use crate::context::{Context, InitContext};
use crate::patch::{PatchStep, StepError};
use futures_util::future::{self, FutureExt};
use log::{error, info, warn};
use parking_lot::ReentrantMutex;
use rusqlite::{Connection, OptionalExtension};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

/// Well-known table whose presence proves the cipher and the schema.
pub const META_TABLE: &str = "META";

const META_PROBE_SQL: &str = "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1;";
const META_CREATE_SQL: &str = "CREATE TABLE IF NOT EXISTS META (name TEXT);";

struct StoreState {
    descriptor: ConnectionDescriptor,
    conn: Option<Connection>,
    valid: bool,
    closed: bool,
}

/// Cloneable handle to one repository's connection.
#[derive(Clone)]
pub struct SqliteStore {
    state: Arc<ReentrantMutex<RefCell<StoreState>>>,
}

impl SqliteStore {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            state: Arc::new(ReentrantMutex::new(RefCell::new(StoreState {
                descriptor,
                conn: None,
                valid: false,
                closed: false,
            }))),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.read(|state| state.valid)
    }

    pub fn is_closed(&self) -> bool {
        self.read(|state| state.closed)
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        self.read(|state| state.descriptor.clone())
    }

    /// Opens the connection if needed and runs the validation probe.
    ///
    /// Calls the login-failed hook once when the cipher does not unlock the
    /// file.
    ///
    /// # Errors
    /// - `AuthenticationFailed` for a wrong cipher or a non-database file.
    /// - `MissingMetaTable` when an existing database lacks `META`.
    /// - `Closed` after `close`.
    pub fn initialize(&self, ctx: &InitContext<'_>) -> DbResult<()> {
        let result = self.open_and_validate();
        if let Err(StoreError::AuthenticationFailed) = result {
            ctx.login_failed();
        }
        result
    }

    /// Re-runs the `META` probe on the open connection.
    pub fn validate_connection(&self) -> DbResult<()> {
        self.write(|state| {
            let outcome = match state.conn.as_ref() {
                Some(conn) => probe_meta(conn),
                None => Err(StoreError::InvalidState),
            };
            state.valid = outcome.is_ok();
            outcome
        })
    }

    fn open_and_validate(&self) -> DbResult<()> {
        self.write(|state| {
            if state.closed {
                return Err(StoreError::Closed);
            }
            if state.valid {
                return Ok(());
            }

            if state.conn.is_none() {
                let fresh = state.descriptor.is_fresh();
                let conn =
                    open_connection(&state.descriptor).map_err(StoreError::classify_unlock)?;
                if fresh {
                    conn.execute_batch(META_CREATE_SQL)
                        .map_err(|err| StoreError::classify_unlock(err.into()))?;
                }
                state.conn = Some(conn);
            }

            let outcome = match state.conn.as_ref() {
                Some(conn) => probe_meta(conn),
                None => Err(StoreError::InvalidState),
            };
            state.valid = outcome.is_ok();
            outcome
        })
    }

    /// Runs `f` against the open connection.
    ///
    /// # Errors
    /// Returns `InvalidState` while the store is not valid, or the backend
    /// error raised by `f`.
    pub fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.state.lock();
        let state = guard.try_borrow().map_err(|_| StoreError::InvalidState)?;
        let conn = valid_connection(&state)?;
        f(conn).map_err(StoreError::from)
    }

    /// Executes a SQL batch in a store-owned transaction, or inside the
    /// caller's open transaction.
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.with_connection(|conn| in_scope(conn, |conn| conn.execute_batch(sql)))
    }

    /// Runs `action` for `sql` inside a transaction owned by this call unless
    /// one is already open.
    ///
    /// Backend failures are logged to `ctx` and yield `Ok(None)`; an empty
    /// `sql` is logged and yields `Ok(None)` without running `action`.
    ///
    /// # Errors
    /// Returns `InvalidState` while the store is not valid.
    pub fn audit<T, F>(&self, ctx: &dyn Context, sql: &str, action: F) -> DbResult<Option<T>>
    where
        F: FnOnce(&mut AuditCommand<'_>) -> rusqlite::Result<T>,
    {
        let guard = self.state.lock();
        let state = guard.try_borrow().map_err(|_| StoreError::InvalidState)?;
        let conn = valid_connection(&state)?;
        Ok(audit_on(conn, ctx, sql, action))
    }

    /// Runs every command in one shared transaction; returns whether all of
    /// them succeeded and were committed (or joined the caller's transaction).
    ///
    /// # Errors
    /// Returns `InvalidState` while the store is not valid.
    pub fn audit_all(
        &self,
        ctx: &dyn Context,
        commands: Vec<(&str, AuditAction<'_>)>,
    ) -> DbResult<bool> {
        let guard = self.state.lock();
        let state = guard.try_borrow().map_err(|_| StoreError::InvalidState)?;
        let conn = valid_connection(&state)?;
        Ok(audit_all_on(conn, ctx, commands))
    }

    /// Runs `PRAGMA integrity_check` and reports whether it returned `ok`.
    ///
    /// A failing probe does not change validity.
    pub fn integrity_check(&self, ctx: &dyn Context) -> bool {
        let started_at = Instant::now();
        let outcome = self.with_connection(|conn| {
            conn.query_row("PRAGMA integrity_check;", [], |row| row.get::<_, String>(0))
        });

        match outcome {
            Ok(result) => {
                ctx.log(&format!("Database integrity check=[{result}]"));
                let ok = is_integrity_ok(&result);
                info!(
                    "event=db_integrity module=db status={} duration_ms={}",
                    if ok { "ok" } else { "error" },
                    started_at.elapsed().as_millis()
                );
                if !ok {
                    ctx.log_error(&StoreError::IntegrityFailed(result));
                }
                ok
            }
            Err(err) => {
                error!(
                    "event=db_integrity module=db status=error duration_ms={} error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                ctx.log_error(&err);
                false
            }
        }
    }

    /// Builds a patch step executing `sql` on this store.
    pub fn sql_step(&self, sql: impl Into<String>) -> PatchStep {
        let store = self.clone();
        let sql = sql.into();
        PatchStep::new(move |_ctx| {
            future::ready(store.execute_batch(&sql).map_err(StepError::from)).boxed()
        })
    }

    /// Releases the connection. Safe to call repeatedly or before opening.
    ///
    /// # Errors
    /// - `InvalidState` when called from an action that still uses the
    ///   connection; nothing is closed then.
    /// - The backend error when SQLite refuses to close; the store is still
    ///   marked invalid and closed.
    pub fn close(&self) -> DbResult<()> {
        let started_at = Instant::now();
        let conn = self.write(|state| {
            state.valid = false;
            state.closed = true;
            Ok(state.conn.take())
        })?;

        let Some(conn) = conn else {
            return Ok(());
        };

        match conn.close() {
            Ok(()) => {
                info!(
                    "event=db_close module=db status=ok duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err((_conn, err)) => {
                warn!(
                    "event=db_close module=db status=error duration_ms={} error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err.into())
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state)
    }

    // Mutation is refused while a caller up the stack still borrows the state.
    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> DbResult<T>) -> DbResult<T> {
        let guard = self.state.lock();
        let mut state = guard
            .try_borrow_mut()
            .map_err(|_| StoreError::InvalidState)?;
        f(&mut state)
    }
}

fn valid_connection(state: &StoreState) -> DbResult<&Connection> {
    if !state.valid {
        return Err(StoreError::InvalidState);
    }
    state.conn.as_ref().ok_or(StoreError::InvalidState)
}

fn probe_meta(conn: &Connection) -> DbResult<()> {
    let table: Option<String> = conn
        .query_row(META_PROBE_SQL, [META_TABLE], |row| row.get(0))
        .optional()
        .map_err(|err| StoreError::classify_unlock(err.into()))?;
    match table {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(StoreError::MissingMetaTable),
    }
}
