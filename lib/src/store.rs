// Copyright 2024 The pgit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! The store facade: owns the connection pool and hands out the per-table
//! sub-stores. The pool is the only process-wide resource; it is passed
//! explicitly, never through global state.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use sqlx::Executor as _;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::commit_graph::CommitGraph;
use crate::commit_store::CommitStore;
use crate::content_store::ContentStore;
use crate::file_refs::FileRefStore;
use crate::object_id::CommitId;
use crate::object_id::GroupId;
use crate::object_id::IdParseError;
use crate::object_id::TimeTokenGenerator;
use crate::object_id::VersionId;
use crate::paths::PathRegistry;
use crate::refs::RefStore;
use crate::schema;

/// Per-session settings applied to every import connection. `commit_delay`
/// is in microseconds. Safe because import resumes from its input stream on
/// crash.
const IMPORT_SESSION_GUCS: &str = "SET synchronous_commit = off; SET commit_delay = 100";
const RESET_SESSION_GUCS: &str = "RESET synchronous_commit; RESET commit_delay";

/// Error type shared by every store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Commit {id} not found")]
    CommitNotFound { id: String },
    #[error("Ref {name:?} not found")]
    RefNotFound { name: String },
    #[error(
        "Commit {id} has no ancestor {distance} steps back (history is shorter than that)"
    )]
    AncestorOutOfRange { id: CommitId, distance: u64 },
    #[error(
        "Commit id prefix {prefix:?} is ambiguous: {}",
        candidates.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
    )]
    AmbiguousIdPrefix {
        prefix: String,
        candidates: Vec<CommitId>,
    },
    #[error(
        "Database schema version {found} is older than {required}; \
         re-import the repository with `pgit import`"
    )]
    SchemaOutdated { found: i32, required: i32 },
    #[error("Database is not initialized; run `pgit init` first")]
    SchemaMissing,
    #[error("Transaction conflict, the operation may be retried")]
    TransactionConflict { #[source] source: sqlx::Error },
    #[error("Invalid regex pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("Ancestor distance must be non-negative, got {distance}")]
    NegativeAncestorDistance { distance: i64 },
    #[error(transparent)]
    InvalidId(#[from] IdParseError),
    #[error(
        "Content row ({group_id}, {version_id}) is missing for a live file-ref; \
         the chain is corrupt, re-import the repository"
    )]
    MissingContent {
        group_id: GroupId,
        version_id: VersionId,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // Serialization failures and deadlocks are transient and retryable;
        // everything else surfaces unchanged.
        match &err {
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001" | "40P01")) =>
            {
                Self::TransactionConflict { source: err }
            }
            _ => Self::Database(err),
        }
    }
}

impl StoreError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransactionConflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Connection and tuning options for a [`Store`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// PostgreSQL connection URL. The server must have the patch-am
    /// extension installed.
    pub url: String,
    pub max_connections: u32,
    pub connection_keep_alive: Duration,
    pub idle_timeout: Duration,
    /// Worker count for bulk import. Bounded by `max_connections` so the
    /// commit writer and progress queries can still get a connection.
    pub import_workers: usize,
    /// Blobs per ingestion chunk within a group transaction.
    pub import_chunk_size: usize,
    /// Worker count for history-wide regex search.
    pub search_workers: usize,
}

impl StoreOptions {
    pub fn new(url: impl Into<String>) -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, usize::from);
        Self {
            url: url.into(),
            max_connections: 32,
            connection_keep_alive: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            import_workers: parallelism.min(30),
            import_chunk_size: 200,
            search_workers: 8,
        }
    }
}

/// Handle to an opened pgit database.
pub struct Store {
    pool: PgPool,
    options: StoreOptions,
    tokens: TimeTokenGenerator,
    import_active: Arc<AtomicBool>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("url", &self.options.url)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Connects and creates the schema if it does not exist yet.
    pub async fn init(options: StoreOptions) -> StoreResult<Arc<Self>> {
        let store = Self::connect(options).await?;
        schema::create_all(store.pool()).await?;
        Ok(store)
    }

    /// Connects to an existing database and verifies its schema version.
    pub async fn load(options: StoreOptions) -> StoreResult<Arc<Self>> {
        let store = Self::connect(options).await?;
        schema::check_version(store.pool()).await?;
        Ok(store)
    }

    async fn connect(options: StoreOptions) -> StoreResult<Arc<Self>> {
        let import_active = Arc::new(AtomicBool::new(false));
        let hook_flag = import_active.clone();
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .max_lifetime(Some(options.connection_keep_alive))
            .idle_timeout(Some(options.idle_timeout))
            .after_connect(move |conn, _meta| {
                let active = hook_flag.clone();
                Box::pin(async move {
                    // Connections created while a bulk import is running must
                    // carry the same session tuning as the ones the import
                    // started with.
                    if active.load(Ordering::Relaxed) {
                        conn.execute(IMPORT_SESSION_GUCS).await?;
                    }
                    Ok(())
                })
            })
            .connect(&options.url)
            .await?;
        Ok(Arc::new(Self {
            pool,
            options,
            tokens: TimeTokenGenerator::new(),
            import_active,
        }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// The process-wide commit token generator.
    pub fn tokens(&self) -> &TimeTokenGenerator {
        &self.tokens
    }

    pub fn paths(&self) -> PathRegistry {
        PathRegistry::new(self.pool.clone())
    }

    pub fn contents(&self) -> ContentStore {
        ContentStore::new(self.pool.clone())
    }

    pub fn file_refs(&self) -> FileRefStore {
        FileRefStore::new(self.pool.clone())
    }

    pub fn commits(&self) -> CommitStore {
        CommitStore::new(self.pool.clone())
    }

    pub fn commit_graph(&self) -> CommitGraph {
        CommitGraph::new(self.pool.clone())
    }

    pub fn refs(&self) -> RefStore {
        RefStore::new(self.pool.clone())
    }

    /// Marks an import as active and returns a guard that resets the flag.
    /// While the flag is set, newly created connections apply the import
    /// session GUCs from the `after_connect` hook; workers apply them to
    /// already-pooled connections as they acquire them.
    pub(crate) fn begin_import_session(self: &Arc<Self>) -> ImportSessionGuard {
        self.import_active.store(true, Ordering::Relaxed);
        ImportSessionGuard {
            flag: self.import_active.clone(),
        }
    }

    /// Applies the import GUCs to one acquired connection.
    pub(crate) async fn tune_connection(
        conn: &mut sqlx::postgres::PgConnection,
    ) -> StoreResult<()> {
        conn.execute(IMPORT_SESSION_GUCS).await?;
        Ok(())
    }

    /// Resets the import GUCs on one connection before it re-enters the pool
    /// for non-import use.
    pub(crate) async fn reset_connection(
        conn: &mut sqlx::postgres::PgConnection,
    ) -> StoreResult<()> {
        conn.execute(RESET_SESSION_GUCS).await?;
        Ok(())
    }
}

/// Clears the import-active flag when the import pipeline finishes or fails.
pub(crate) struct ImportSessionGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ImportSessionGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}
