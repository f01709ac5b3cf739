//! Backend integrity probe.

use super::open::{open_connection, ConnectionDescriptor};
use super::{DbResult, StoreError};
use crate::context::Context;
use async_trait::async_trait;
use log::{error, info};
use std::path::Path;

/// Canonical success answer of `PRAGMA integrity_check`.
const INTEGRITY_OK: &str = "ok";

/// Runs a backend-specific integrity check on a database file.
#[async_trait]
pub trait IntegrityValidator: Send + Sync {
    async fn validate(&self, ctx: &dyn Context, cipher: &str, db_path: &Path) -> bool;
}

/// True iff `result` is the `ok` sentinel, ignoring ASCII case.
pub fn is_integrity_ok(result: &str) -> bool {
    result.eq_ignore_ascii_case(INTEGRITY_OK)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteIntegrityValidator;

impl SqliteIntegrityValidator {
    fn run_check(cipher: &str, db_path: &Path) -> DbResult<String> {
        let descriptor = ConnectionDescriptor::file(db_path)
            .with_cipher(cipher)
            .existing_only();
        let conn = open_connection(&descriptor)?;
        let result = conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0))?;
        Ok(result)
    }
}

#[async_trait]
impl IntegrityValidator for SqliteIntegrityValidator {
    async fn validate(&self, ctx: &dyn Context, cipher: &str, db_path: &Path) -> bool {
        match Self::run_check(cipher, db_path) {
            Ok(result) => {
                ctx.log(&format!("Database integrity check=[{result}]"));
                let ok = is_integrity_ok(&result);
                info!(
                    "event=db_integrity module=db status={} path={}",
                    if ok { "ok" } else { "error" },
                    db_path.display()
                );
                if !ok {
                    ctx.log_error(&StoreError::IntegrityFailed(result));
                }
                ok
            }
            Err(err) => {
                error!(
                    "event=db_integrity module=db status=error path={} error={}",
                    db_path.display(),
                    err
                );
                ctx.log_error(&err);
                false
            }
        }
    }
}
