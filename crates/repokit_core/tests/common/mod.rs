#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::future::{self, FutureExt};
use repokit_core::{
    CompatibilityService, ConnectionDescriptor, Context, EntityTag, InitContext, RepoError,
    RepoResult, Repository, RepositoryTag, SqliteStore, StepError, StoreError, VersionPatch,
};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Context capturing every line it receives.
#[derive(Default)]
pub struct RecordingContext {
    id: Uuid,
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn messages_containing(&self, needle: &str) -> usize {
        self.messages()
            .iter()
            .filter(|message| message.contains(needle))
            .count()
    }
}

impl Context for RecordingContext {
    fn correlation_id(&self) -> Uuid {
        self.id
    }

    fn log(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn log_error(&self, error: &(dyn Error + 'static)) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// Shared, ordered record of lifecycle calls across repositories.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|value| *value == entry).count()
    }
}

/// Where a scripted repository should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    None,
    Authentication,
    Initialize,
    Close,
}

/// In-memory repository whose lifecycle outcome is chosen by the test.
pub struct ScriptedRepository {
    tag: RepositoryTag,
    entity: EntityTag,
    journal: Journal,
    failure: Failure,
    valid: bool,
    patches: Vec<u32>,
}

impl ScriptedRepository {
    pub fn new(name: &'static str, journal: &Journal) -> Self {
        Self {
            tag: RepositoryTag::new(name),
            entity: EntityTag::new(name),
            journal: journal.clone(),
            failure: Failure::None,
            valid: false,
            patches: Vec::new(),
        }
    }

    pub fn failing(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    /// Registers one patch per version; each records its run in the journal.
    pub fn with_patches(mut self, versions: &[u32]) -> Self {
        self.patches = versions.to_vec();
        self
    }

    fn record(&self, stage: &str) {
        self.journal.record(format!("{}:{stage}", self.tag));
    }
}

#[async_trait]
impl Repository for ScriptedRepository {
    fn tag(&self) -> RepositoryTag {
        self.tag
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    async fn initialize(&mut self, ctx: &InitContext<'_>) -> RepoResult<()> {
        self.record("initialize");
        match self.failure {
            Failure::Authentication => {
                self.valid = false;
                ctx.login_failed();
                Err(StoreError::AuthenticationFailed.into())
            }
            Failure::Initialize => {
                self.valid = false;
                Err(RepoError::Other(format!("{} cannot start", self.tag)))
            }
            Failure::None | Failure::Close => {
                self.valid = true;
                Ok(())
            }
        }
    }

    fn register_patches(&mut self, _ctx: &dyn Context, compat: &mut CompatibilityService) {
        self.record("register_patches");
        for version in &self.patches {
            let journal = self.journal.clone();
            let label = format!("{}:patch:{version}", self.tag);
            let patch = VersionPatch::new(*version)
                .unwrap()
                .with_step(move |_ctx| {
                    journal.record(label.clone());
                    future::ready(Ok(())).boxed()
                });
            compat.register_patch(self.entity, patch);
        }
    }

    async fn execute_patches(
        &mut self,
        ctx: &dyn Context,
        compat: &mut CompatibilityService,
    ) -> RepoResult<()> {
        self.record("execute_patches");
        compat.execute_pending(ctx, self.entity).await?;
        Ok(())
    }

    async fn close(&mut self) -> RepoResult<()> {
        self.record("close");
        self.valid = false;
        if self.failure == Failure::Close {
            return Err(RepoError::Other(format!("{} refused to close", self.tag)));
        }
        Ok(())
    }
}

pub const NOTES_TAG: RepositoryTag = RepositoryTag::new("notes");
pub const NOTE_ENTITY: EntityTag = EntityTag::new("note");

/// SQLite repository with a small notes schema built by two patches.
pub struct NotesRepository {
    store: SqliteStore,
    /// Fails the second step of the v2 patch while set.
    pub break_v2: Arc<AtomicUsize>,
    pub v1_runs: Arc<AtomicUsize>,
}

impl NotesRepository {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            store: SqliteStore::new(descriptor),
            break_v2: Arc::new(AtomicUsize::new(0)),
            v1_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn add_note(&self, ctx: &dyn Context, body: &str) -> RepoResult<Option<usize>> {
        let inserted = self
            .store
            .audit(ctx, "INSERT INTO notes (body) VALUES (?1);", |cmd| {
                cmd.execute([body])
            })?;
        Ok(inserted)
    }

    pub fn count_notes(&self) -> RepoResult<i64> {
        let count = self.store.with_connection(|conn| {
            conn.query_row("SELECT count(*) FROM notes;", [], |row| row.get(0))
        })?;
        Ok(count)
    }
}

#[async_trait]
impl Repository for NotesRepository {
    fn tag(&self) -> RepositoryTag {
        NOTES_TAG
    }

    fn is_valid(&self) -> bool {
        self.store.is_valid()
    }

    async fn initialize(&mut self, ctx: &InitContext<'_>) -> RepoResult<()> {
        self.store.initialize(ctx)?;
        Ok(())
    }

    fn register_patches(&mut self, _ctx: &dyn Context, compat: &mut CompatibilityService) {
        let runs = self.v1_runs.clone();
        let v1 = VersionPatch::new(1)
            .unwrap()
            .with_step(move |_ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                future::ready(Ok(())).boxed()
            })
            .with(self.store.sql_step(
                "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
            ));

        let broken = self.break_v2.clone();
        let v2 = VersionPatch::new(2)
            .unwrap()
            .with(self.store.sql_step(
                "CREATE TABLE IF NOT EXISTS tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
            ))
            .with_step(move |_ctx| {
                let result = if broken.load(Ordering::SeqCst) > 0 {
                    Err(StepError::message("v2 step interrupted"))
                } else {
                    Ok(())
                };
                future::ready(result).boxed()
            });

        compat.register_patch(NOTE_ENTITY, v1);
        compat.register_patch(NOTE_ENTITY, v2);
    }

    async fn execute_patches(
        &mut self,
        ctx: &dyn Context,
        compat: &mut CompatibilityService,
    ) -> RepoResult<()> {
        compat.execute_pending(ctx, NOTE_ENTITY).await?;
        Ok(())
    }

    async fn close(&mut self) -> RepoResult<()> {
        self.store.close()?;
        Ok(())
    }
}

pub fn no_login_hook() -> impl Fn() + Send + Sync {
    || {}
}

/// Hook counting how often it fired.
pub fn counting_hook() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    (calls, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}
