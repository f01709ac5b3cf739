//! Per-call diagnostic context.
//!
//! # Responsibility
//! - Carry a correlation id and the originating thread through lifecycle calls.
//! - Accept plain messages, single errors and error aggregates.
//! - Route the login-failed signal from repositories to the host during
//!   initialization.
//!
//! # Invariants
//! - Implementations must not panic while logging.
//! - `Context` is `Send + Sync` so borrowed contexts may cross `.await` points.

use crate::logging::sanitize_message;
use log::{error, info};
use std::error::Error;
use std::thread::{self, ThreadId};
use uuid::Uuid;

const MAX_CONTEXT_MESSAGE_CHARS: usize = 512;

/// Log sink and correlation identity handed to every lifecycle operation.
pub trait Context: Send + Sync {
    fn correlation_id(&self) -> Uuid;

    /// Thread the context traces; the calling thread unless overridden.
    fn thread_id(&self) -> ThreadId {
        thread::current().id()
    }

    fn log(&self, message: &str);

    fn log_error(&self, error: &(dyn Error + 'static));

    /// Logs every error of an aggregate failure.
    fn log_errors(&self, errors: &[&(dyn Error + 'static)]) {
        for error in errors {
            self.log_error(*error);
        }
    }
}

/// Default context writing to the `log` facade.
#[derive(Debug, Clone, Copy)]
pub struct LogContext {
    correlation_id: Uuid,
    thread_id: ThreadId,
}

impl LogContext {
    pub fn new() -> Self {
        Self::with_correlation_id(Uuid::new_v4())
    }

    /// Creates a context bound to the calling thread.
    pub fn with_correlation_id(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            thread_id: thread::current().id(),
        }
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Context for LogContext {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn log(&self, message: &str) {
        info!(
            "event=context_log module=context correlation_id={} thread={:?} message={}",
            self.correlation_id,
            self.thread_id,
            sanitize_message(message, MAX_CONTEXT_MESSAGE_CHARS)
        );
    }

    fn log_error(&self, error: &(dyn Error + 'static)) {
        error!(
            "event=context_error module=context status=error correlation_id={} thread={:?} error={}",
            self.correlation_id,
            self.thread_id,
            sanitize_message(&error_chain(error), MAX_CONTEXT_MESSAGE_CHARS)
        );
    }
}

/// Context wrapper handed to `Repository::initialize`.
///
/// Delegates logging to the caller's context and exposes the host's
/// login-failed hook to repositories that detect a bad cipher.
pub struct InitContext<'a> {
    inner: &'a dyn Context,
    on_login_failed: &'a (dyn Fn() + Send + Sync),
}

impl<'a> InitContext<'a> {
    pub fn new(inner: &'a dyn Context, on_login_failed: &'a (dyn Fn() + Send + Sync)) -> Self {
        Self {
            inner,
            on_login_failed,
        }
    }

    /// Signals the host that the supplied credentials did not unlock a store.
    pub fn login_failed(&self) {
        info!(
            "event=login_failed module=context status=error correlation_id={}",
            self.inner.correlation_id()
        );
        (self.on_login_failed)();
    }
}

impl Context for InitContext<'_> {
    fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id()
    }

    fn thread_id(&self) -> ThreadId {
        self.inner.thread_id()
    }

    fn log(&self, message: &str) {
        self.inner.log(message);
    }

    fn log_error(&self, error: &(dyn Error + 'static)) {
        self.inner.log_error(error);
    }

    fn log_errors(&self, errors: &[&(dyn Error + 'static)]) {
        self.inner.log_errors(errors);
    }
}

/// Renders an error followed by its `source()` chain.
pub(crate) fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
