//! Versioned patch engine.
//!
//! # Responsibility
//! - Bundle ordered, fallible async migration steps under a target version.
//! - Remember which steps succeeded so a retried patch resumes where it failed.
//!
//! # Invariants
//! - `version > 0`.
//! - Step order is fixed by insertion.
//! - A step is marked applied only after it returned `Ok`; applied steps are
//!   never run again by the same `VersionPatch`.
//! - The first failing step aborts the patch; later steps are not attempted.

use crate::context::Context;
use crate::db::StoreError;
use futures_util::future::BoxFuture;
use log::{debug, warn};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

/// Future returned by one patch step.
pub type StepFuture<'a> = BoxFuture<'a, StepResult>;

pub type StepResult = Result<(), StepError>;

type StepFn = Box<dyn for<'a> Fn(&'a dyn Context) -> StepFuture<'a> + Send + Sync>;

/// Failure reported by a patch step.
#[derive(Debug)]
pub enum StepError {
    Store(StoreError),
    Message(String),
}

impl StepError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl Display for StepError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Message(message) => f.write_str(message),
        }
    }
}

impl Error for StepError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Message(_) => None,
        }
    }
}

impl From<StoreError> for StepError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for StepError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(value))
    }
}

/// Patch construction and execution errors.
#[derive(Debug)]
pub enum PatchError {
    InvalidVersion(u32),
    StepFailed {
        version: u32,
        step: usize,
        source: StepError,
    },
}

impl Display for PatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidVersion(version) => {
                write!(f, "patch version must be greater than zero, got {version}")
            }
            Self::StepFailed {
                version,
                step,
                source,
            } => write!(f, "patch version={version} step={step} failed: {source}"),
        }
    }
}

impl Error for PatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidVersion(_) => None,
            Self::StepFailed { source, .. } => Some(source),
        }
    }
}

/// One idempotent migration action.
pub struct PatchStep {
    action: StepFn,
}

impl PatchStep {
    pub fn new<F>(action: F) -> Self
    where
        F: for<'a> Fn(&'a dyn Context) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self {
            action: Box::new(action),
        }
    }
}

impl Debug for PatchStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchStep").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct TrackedStep {
    step: PatchStep,
    applied: bool,
}

/// Ordered steps that promote an entity to `version`.
#[derive(Debug)]
pub struct VersionPatch {
    version: u32,
    steps: Vec<TrackedStep>,
}

impl VersionPatch {
    /// Creates an empty patch targeting `version`.
    ///
    /// # Errors
    /// Returns `PatchError::InvalidVersion` when `version` is zero.
    pub fn new(version: u32) -> Result<Self, PatchError> {
        if version == 0 {
            return Err(PatchError::InvalidVersion(version));
        }
        Ok(Self {
            version,
            steps: Vec::new(),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Appends a closure step. Must happen before the first `patch` call.
    pub fn add_step<F>(&mut self, action: F)
    where
        F: for<'a> Fn(&'a dyn Context) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.push(PatchStep::new(action));
    }

    pub fn with_step<F>(mut self, action: F) -> Self
    where
        F: for<'a> Fn(&'a dyn Context) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.add_step(action);
        self
    }

    pub fn push(&mut self, step: PatchStep) {
        self.steps.push(TrackedStep {
            step,
            applied: false,
        });
    }

    pub fn with(mut self, step: PatchStep) -> Self {
        self.push(step);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn applied_count(&self) -> usize {
        self.steps.iter().filter(|tracked| tracked.applied).count()
    }

    /// Returns true once every step has succeeded at least once.
    pub fn is_applied(&self) -> bool {
        self.steps.iter().all(|tracked| tracked.applied)
    }

    /// Runs every step not yet applied, in order.
    ///
    /// # Errors
    /// Returns `PatchError::StepFailed` for the first failing step; that step
    /// and all following steps stay unapplied.
    pub async fn patch(&mut self, ctx: &dyn Context) -> Result<(), PatchError> {
        let version = self.version;
        for (index, tracked) in self.steps.iter_mut().enumerate() {
            if tracked.applied {
                debug!("event=patch_step module=patch status=skipped version={version} step={index}");
                continue;
            }

            match (tracked.step.action)(ctx).await {
                Ok(()) => {
                    tracked.applied = true;
                    debug!("event=patch_step module=patch status=ok version={version} step={index}");
                }
                Err(source) => {
                    warn!(
                        "event=patch_step module=patch status=error version={version} step={index} error={source}"
                    );
                    return Err(PatchError::StepFailed {
                        version,
                        step: index,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}
