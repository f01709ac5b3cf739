//! Audited statement execution with outermost-transaction ownership.
//!
//! # Invariants
//! - The audit that finds the connection in autocommit mode owns the
//!   transaction: it commits on success and rolls back on failure.
//! - A nested audit joins the open transaction and never commits or rolls
//!   back on its own.
//! - Errors are logged to the context and turned into `None`.

use super::StoreError;
use crate::context::Context;
use log::warn;
use rusqlite::{Connection, Statement};
use std::ops::{Deref, DerefMut};

/// Action run by `SqliteStore::audit_all`; each shares the batch transaction.
pub type AuditAction<'f> = Box<dyn FnOnce(&mut AuditCommand<'_>) -> rusqlite::Result<()> + 'f>;

/// Prepared statement handed to an audit action.
///
/// Dereferences to the underlying `Statement`; `audit` runs a nested command
/// inside the same transaction.
pub struct AuditCommand<'c> {
    conn: &'c Connection,
    stmt: Statement<'c>,
}

impl<'c> AuditCommand<'c> {
    fn prepare(conn: &'c Connection, sql: &str) -> rusqlite::Result<Self> {
        let stmt = conn.prepare(sql)?;
        Ok(Self { conn, stmt })
    }

    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Runs `action` for `sql` inside the enclosing transaction.
    pub fn audit<T, F>(&self, ctx: &dyn Context, sql: &str, action: F) -> Option<T>
    where
        F: FnOnce(&mut AuditCommand<'_>) -> rusqlite::Result<T>,
    {
        audit_on(self.conn, ctx, sql, action)
    }
}

impl<'c> Deref for AuditCommand<'c> {
    type Target = Statement<'c>;

    fn deref(&self) -> &Self::Target {
        &self.stmt
    }
}

impl DerefMut for AuditCommand<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.stmt
    }
}

pub(crate) fn audit_on<T, F>(conn: &Connection, ctx: &dyn Context, sql: &str, action: F) -> Option<T>
where
    F: FnOnce(&mut AuditCommand<'_>) -> rusqlite::Result<T>,
{
    if sql.trim().is_empty() {
        warn!("event=audit module=db status=skipped reason=empty_command");
        ctx.log("Command text is empty");
        return None;
    }

    let mut result = None;
    let outcome = in_scope(conn, |conn| {
        let mut command = AuditCommand::prepare(conn, sql)?;
        result = Some(action(&mut command)?);
        Ok(())
    });
    report(ctx, outcome).and(result)
}

pub(crate) fn audit_all_on(
    conn: &Connection,
    ctx: &dyn Context,
    commands: Vec<(&str, AuditAction<'_>)>,
) -> bool {
    if commands.iter().any(|(sql, _)| sql.trim().is_empty()) {
        warn!("event=audit module=db status=skipped reason=empty_command");
        ctx.log("Command text is empty");
        return false;
    }

    let outcome = in_scope(conn, |conn| {
        for (sql, action) in commands {
            let mut command = AuditCommand::prepare(conn, sql)?;
            action(&mut command)?;
        }
        Ok(())
    });
    report(ctx, outcome).is_some()
}

/// Runs `body` in the caller's transaction, or in a new one when none is open.
pub(crate) fn in_scope<F>(conn: &Connection, body: F) -> rusqlite::Result<()>
where
    F: FnOnce(&Connection) -> rusqlite::Result<()>,
{
    if !conn.is_autocommit() {
        return body(conn);
    }

    let tx = conn.unchecked_transaction()?;
    body(&tx)?;
    tx.commit()
}

fn report(ctx: &dyn Context, outcome: rusqlite::Result<()>) -> Option<()> {
    match outcome {
        Ok(()) => Some(()),
        Err(err) => {
            let err = StoreError::from(err);
            warn!("event=audit module=db status=error error={err}");
            ctx.log_error(&err);
            None
        }
    }
}
