// Copyright 2025 The pgit Authors
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

//! The bulk-import pipeline.
//!
//! Import runs in fixed steps: group paths by content similarity, register
//! every path up front, tune the sessions, drop the secondary indexes, then
//! ingest groups on a worker pool while a dedicated task writes commits and
//! graph entries. All blobs of one group flow through one connection inside
//! one transaction, end-to-end, which is what lets the access method build a
//! single long delta chain per group instead of receiving interleaved
//! inserts.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use sqlx::Connection as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::commit_graph;
use crate::commit_graph::GraphBuilder;
use crate::commit_store;
use crate::commit_store::CommitRecord;
use crate::commit_store::Signature;
use crate::content_store;
use crate::content_store::ContentKind;
use crate::copy::CopyBuffer;
use crate::file_refs;
use crate::file_refs::FileRef;
use crate::file_refs::FileRefStore;
use crate::grouping::PathGrouper;
use crate::object_id::CommitId;
use crate::object_id::ContentHash;
use crate::object_id::GroupId;
use crate::object_id::PathId;
use crate::object_id::VersionId;
use crate::paths::RegisteredPath;
use crate::schema;
use crate::schema::ChainedTable;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;

/// Commits per batch written by the commit/graph task.
const COMMIT_BATCH: usize = 500;

/// A commit as the producer hands it over: metadata plus the blob set of
/// the files changed at this commit. Content bytes stay in the source and
/// are pulled by hash during ingestion.
#[derive(Clone, Debug)]
pub struct SourceCommit {
    pub message: String,
    pub author: Signature,
    pub committer: Signature,
    pub tree_hash: Option<String>,
    pub blobs: Vec<SourceBlob>,
}

/// One changed file within a [`SourceCommit`].
#[derive(Clone, Debug)]
pub struct SourceBlob {
    pub path: String,
    /// `None` marks a deletion at this commit.
    pub hash: Option<ContentHash>,
    pub mode: i32,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
    pub is_binary: bool,
}

/// The import pipeline's view of its input: a chronological commit list and
/// content-addressed blob payloads. The source (typically a temp file
/// written by the working-tree front end) is the ground truth; the database
/// is derivable from it, which is why relaxed durability during import is
/// safe.
pub trait ImportSource: Send + Sync {
    /// Commit headers in chronological order.
    fn commits(&self) -> StoreResult<Vec<SourceCommit>>;

    /// Payload bytes for a blob. Called from ingestion workers, so it should
    /// be a cheap local read.
    fn read_blob(&self, hash: &ContentHash) -> StoreResult<Vec<u8>>;
}

#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    /// Cap on commits scanned by the grouping pass; `None` scans the full
    /// stream. Very large sources get a head sample.
    pub grouping_sample: Option<usize>,
    /// Record a sync watermark under this remote name when done.
    pub sync_remote: Option<String>,
}

/// Progress snapshot passed to the callback after every ingested chunk and
/// commit batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportProgress {
    pub groups_done: usize,
    pub groups_total: usize,
    pub blobs_done: u64,
    pub commits_done: u64,
}

type ProgressFn = dyn Fn(ImportProgress) + Send + Sync;

/// What an import run did. Consumed by callers and by the external
/// benchmarking harness.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ImportReport {
    pub commits: u64,
    pub blobs: u64,
    /// Content rows skipped because an identical payload already existed in
    /// the same group.
    pub deduped: u64,
    pub groups: usize,
    /// Groups skipped because a previous run already ingested them.
    pub resumed_groups: usize,
    /// Groups whose transaction failed after the retry; the rest of the
    /// import is unaffected.
    pub failed_groups: Vec<FailedGroup>,
    #[serde(serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct FailedGroup {
    pub group_id: GroupId,
    pub error: String,
}

fn serialize_elapsed<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Work for one group: every blob of every (new) commit touching the group,
/// in stream order.
struct GroupWork {
    group_id: GroupId,
    first_version: VersionId,
    items: Vec<WorkItem>,
}

struct WorkItem {
    path_id: PathId,
    commit_id: CommitId,
    blob: SourceBlob,
}

/// A work item with its version assigned and dedup resolved.
struct StagedRef {
    file_ref: FileRef,
    /// Whether this row introduces a new content payload (false for
    /// tombstones and dedup hits).
    new_content: bool,
}

/// Assigns `version_id`s for one group in stream order.
///
/// A content hash already seen in the group reuses its `version_id` and
/// stages no content row; deletions consume a fresh version with no content
/// row. Returns the staged refs and the dedup count.
fn assign_versions(first: VersionId, items: &[WorkItem]) -> (Vec<StagedRef>, u64) {
    let mut next = first.value();
    let mut seen: HashMap<ContentHash, VersionId> = HashMap::new();
    let mut staged = Vec::with_capacity(items.len());
    let mut deduped = 0_u64;
    for item in items {
        let (version_id, new_content) = match item.blob.hash {
            None => {
                let v = VersionId(next);
                next += 1;
                (v, false)
            }
            Some(hash) => match seen.get(&hash) {
                Some(&v) => {
                    deduped += 1;
                    (v, false)
                }
                None => {
                    let v = VersionId(next);
                    next += 1;
                    seen.insert(hash, v);
                    (v, true)
                }
            },
        };
        staged.push(StagedRef {
            file_ref: FileRef {
                path_id: item.path_id,
                commit_id: item.commit_id.clone(),
                version_id,
                content_hash: item.blob.hash,
                mode: item.blob.mode,
                is_symlink: item.blob.is_symlink,
                symlink_target: item.blob.symlink_target.clone(),
                is_binary: item.blob.is_binary,
            },
            new_content,
        });
    }
    (staged, deduped)
}

#[derive(Default)]
struct Counters {
    blobs_done: AtomicU64,
    commits_done: AtomicU64,
    deduped: AtomicU64,
    groups_done: AtomicUsize,
}

struct Shared {
    store: Arc<Store>,
    source: Arc<dyn ImportSource>,
    counters: Counters,
    groups_total: usize,
    progress: Option<Arc<ProgressFn>>,
    failed: Mutex<Vec<FailedGroup>>,
    cancel: CancellationToken,
}

impl Shared {
    fn report_progress(&self) {
        if let Some(progress) = &self.progress {
            progress(ImportProgress {
                groups_done: self.counters.groups_done.load(Ordering::Relaxed),
                groups_total: self.groups_total,
                blobs_done: self.counters.blobs_done.load(Ordering::Relaxed),
                commits_done: self.counters.commits_done.load(Ordering::Relaxed),
            });
        }
    }
}

pub struct Importer {
    store: Arc<Store>,
    options: ImportOptions,
    progress: Option<Arc<ProgressFn>>,
}

impl Importer {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            options: ImportOptions::default(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_progress(
        mut self,
        callback: impl Fn(ImportProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Runs the whole pipeline. A failed group aborts only itself; a
    /// cancelled run rolls back in-flight group transactions and returns
    /// [`StoreError::Cancelled`].
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        source: Arc<dyn ImportSource>,
        cancel: CancellationToken,
    ) -> StoreResult<ImportReport> {
        let started = Instant::now();
        let commits = source.commits()?;

        // Step A: grouping over the stream (or a head sample).
        let mut grouper = PathGrouper::new();
        let sample = self.options.grouping_sample.unwrap_or(commits.len());
        for commit in commits.iter().take(sample) {
            grouper.observe_commit(
                commit
                    .blobs
                    .iter()
                    .map(|blob| (blob.path.as_str(), blob.hash)),
            );
        }
        // Paths past the sample still need registration; they join as
        // singletons.
        for commit in commits.iter().skip(sample) {
            grouper.observe_commit(commit.blobs.iter().map(|blob| (blob.path.as_str(), None)));
        }
        let assignments = grouper.assignments();
        info!(
            commits = commits.len(),
            paths = assignments.len(),
            "grouping pass done"
        );

        // Step B: pre-register every path.
        let registry = self.store.paths();
        let registered = registry.pre_register(&assignments).await?;

        // Commit ids are a pure function of the stream, so a re-run plans
        // the identical history and resume can compare against what is
        // already durable instead of trusting a watermark.
        let planned = plan_commits(&commits);

        // Group work spans the whole stream; anything an earlier run made
        // durable is filtered out here. Groups with no registered imports
        // are kept wholesale, which is what retries a group whose
        // transaction failed last time.
        let work = plan_groups(&commits, &planned, &registered);
        let resume_set = registry.imported_paths().await?;
        let (work, resumed_groups) =
            filter_resumed(work, &registered, &resume_set, &self.store.file_refs()).await?;
        let group_versions = registry
            .max_version_ids(&work.iter().map(|w| w.group_id).collect::<Vec<_>>())
            .await?;
        let work: Vec<GroupWork> = work
            .into_iter()
            .map(|mut w| {
                w.first_version = group_versions
                    .get(&w.group_id)
                    .map_or(VersionId(1), |v| VersionId(v.value() + 1));
                w
            })
            .collect();

        // Step C: session tuning stays active for the whole run; the
        // after-connect hook covers connections created mid-import.
        let _session = self.store.begin_import_session();

        // Step D: drop secondary indexes, keep primary keys.
        schema::drop_secondary_indexes(self.store.pool()).await?;

        let shared = Arc::new(Shared {
            store: self.store.clone(),
            source,
            counters: Counters::default(),
            groups_total: work.len(),
            progress: self.progress.clone(),
            failed: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
        });

        // Step E: parallel ingestion plus the dedicated commit writer. The
        // writer skips commits whose graph entries already exist, so a
        // resumed run only appends what a previous one lost.
        let graph = self.store.commit_graph();
        let graph_entries = graph.load_all().await?;
        let commit_task = {
            let shared = shared.clone();
            let planned = planned.clone();
            tokio::spawn(async move { write_commits(&shared, graph_entries, &planned).await })
        };

        let workers = self.store.options().import_workers.max(1);
        let (tx, rx) = async_channel::bounded::<GroupWork>(workers);
        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = shared.clone();
            let rx = rx.clone();
            worker_handles.push(tokio::spawn(async move {
                run_worker(worker_id, &shared, rx).await
            }));
        }
        drop(rx);

        let mut send_err = None;
        for group in work {
            if cancel.is_cancelled() {
                send_err = Some(StoreError::Cancelled);
                break;
            }
            // The bounded queue is the back-pressure: sends block while all
            // workers are busy.
            if tx.send(group).await.is_err() {
                break;
            }
        }
        drop(tx);

        for handle in worker_handles {
            handle.await.expect("import worker panicked")?;
        }
        commit_task.await.expect("commit writer panicked")?;

        if let Some(err) = send_err {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        // Refs and sync state land once everything else is in.
        if let Some(last) = planned.last() {
            self.store.refs().set_head(&last.id).await?;
            if let Some(remote) = &self.options.sync_remote {
                self.store
                    .refs()
                    .set_sync_state(remote, &last.id, chrono::Utc::now())
                    .await?;
            }
        }

        // Step F: rebuild indexes in parallel.
        schema::rebuild_secondary_indexes(self.store.pool()).await?;
        graph.sync_sequence().await?;

        // Step G: session GUCs reset as each worker parked its connection;
        // dropping the guard stops the hook re-applying them. Refresh chain
        // statistics on everything the bulk writers touched.
        schema::refresh_chain_stats(self.store.pool(), &ChainedTable::ALL).await?;

        let report = ImportReport {
            commits: shared.counters.commits_done.load(Ordering::Relaxed),
            blobs: shared.counters.blobs_done.load(Ordering::Relaxed),
            deduped: shared.counters.deduped.load(Ordering::Relaxed),
            groups: shared.groups_total,
            resumed_groups,
            failed_groups: shared.failed.lock().unwrap().clone(),
            elapsed: started.elapsed(),
        };
        info!(
            commits = report.commits,
            blobs = report.blobs,
            deduped = report.deduped,
            groups = report.groups,
            failed = report.failed_groups.len(),
            "import finished"
        );
        Ok(report)
    }
}

/// Plans the whole history: every commit of the stream gets an id derived
/// from its position and content, chained onto the previous one.
///
/// Determinism is what makes crash resume sound: a re-run of the same
/// stream re-derives the ids an interrupted run used, so file-refs that
/// were already made durable line up with the commits planned here instead
/// of being orphaned under ids that were never persisted.
fn plan_commits(commits: &[SourceCommit]) -> Vec<CommitRecord> {
    let mut planned = Vec::with_capacity(commits.len());
    let mut parent: Option<CommitId> = None;
    let mut last_ms = -1_i64;
    for (position, commit) in commits.iter().enumerate() {
        // Token order must match chain order, so ties and backward author
        // clocks are bumped forward by a millisecond.
        let ms = commit.author.at.timestamp_millis().max(0).max(last_ms + 1);
        last_ms = ms;
        let id = derive_commit_id(position, ms, commit);
        planned.push(CommitRecord {
            id: id.clone(),
            parent_id: parent.take(),
            tree_hash: commit.tree_hash.clone(),
            message: commit.message.clone(),
            author: commit.author.clone(),
            committer: commit.committer.clone(),
        });
        parent = Some(id);
    }
    planned
}

/// Derives a commit token whose entropy tail is a digest of the commit's
/// stream position and content. Same stream, same ids, every run.
fn derive_commit_id(position: usize, ms: i64, commit: &SourceCommit) -> CommitId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(position as u64).to_be_bytes());
    hasher.update(&ms.to_be_bytes());
    hasher.update(commit.message.as_bytes());
    for signature in [&commit.author, &commit.committer] {
        hasher.update(signature.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(signature.email.as_bytes());
        hasher.update(&[0]);
        hasher.update(&signature.at.timestamp_millis().to_be_bytes());
    }
    if let Some(tree_hash) = &commit.tree_hash {
        hasher.update(tree_hash.as_bytes());
    }
    for blob in &commit.blobs {
        hasher.update(blob.path.as_bytes());
        hasher.update(&[0]);
        match &blob.hash {
            Some(hash) => hasher.update(hash.as_bytes()),
            None => hasher.update(&[0xff]),
        };
    }
    let digest = hasher.finalize();
    let mut entropy = [0_u8; 10];
    entropy.copy_from_slice(&digest.as_bytes()[..10]);
    CommitId::from_parts(ms, entropy)
}

/// Buckets the blobs of every planned commit by group, in stream order.
fn plan_groups(
    commits: &[SourceCommit],
    planned: &[CommitRecord],
    registered: &HashMap<String, RegisteredPath>,
) -> Vec<GroupWork> {
    let mut by_group: BTreeMap<GroupId, Vec<WorkItem>> = BTreeMap::new();
    for (commit, record) in commits.iter().zip(planned) {
        for blob in &commit.blobs {
            let path = &registered[&blob.path];
            by_group.entry(path.group_id).or_default().push(WorkItem {
                path_id: path.path_id,
                commit_id: record.id.clone(),
                blob: blob.clone(),
            });
        }
    }
    by_group
        .into_iter()
        .map(|(group_id, items)| GroupWork {
            group_id,
            first_version: VersionId(1),
            items,
        })
        .collect()
}

/// Drops the work an earlier run already made durable.
///
/// Groups with no imported path are kept whole (this is what re-runs a
/// group whose transaction failed last time). Groups that already carry
/// refs are compared ref-by-ref against the planned items: fully ingested
/// groups disappear, partially covered ones keep only the missing items.
async fn filter_resumed(
    work: Vec<GroupWork>,
    registered: &HashMap<String, RegisteredPath>,
    imported: &HashSet<String>,
    file_refs: &FileRefStore,
) -> StoreResult<(Vec<GroupWork>, usize)> {
    if imported.is_empty() {
        return Ok((work, 0));
    }
    let mut touched_groups: HashSet<GroupId> = HashSet::new();
    for path in registered.values() {
        if imported.contains(&path.path) {
            touched_groups.insert(path.group_id);
        }
    }
    let probe_paths: Vec<PathId> = work
        .iter()
        .filter(|w| touched_groups.contains(&w.group_id))
        .flat_map(|w| w.items.iter().map(|item| item.path_id))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let existing = file_refs.existing_keys_for_paths(&probe_paths).await?;

    let mut skipped = 0;
    let mut blobs_skipped = 0_u64;
    let kept: Vec<GroupWork> = work
        .into_iter()
        .filter_map(|mut w| {
            if !touched_groups.contains(&w.group_id) {
                return Some(w);
            }
            let before = w.items.len();
            w.items
                .retain(|item| !existing.contains(&(item.path_id, item.commit_id.clone())));
            blobs_skipped += (before - w.items.len()) as u64;
            if w.items.is_empty() {
                skipped += 1;
                None
            } else {
                Some(w)
            }
        })
        .collect();
    if skipped > 0 || blobs_skipped > 0 {
        info!(
            groups = skipped,
            blobs = blobs_skipped,
            "skipping work already ingested by a previous run"
        );
    }
    Ok((kept, skipped))
}

/// One pool worker: owns one tuned connection for its whole lifetime and
/// ingests groups off the queue until it closes.
async fn run_worker(
    worker_id: usize,
    shared: &Shared,
    rx: async_channel::Receiver<GroupWork>,
) -> StoreResult<()> {
    let mut conn = shared.store.pool().acquire().await?;
    Store::tune_connection(&mut conn).await?;
    while let Ok(group) = rx.recv().await {
        if shared.cancel.is_cancelled() {
            break;
        }
        let group_id = group.group_id;
        let mut attempt = ingest_group(shared, &mut conn, &group).await;
        if let Err(err) = &attempt
            && err.is_transient()
        {
            warn!(%group_id, error = %err, "group hit a transaction conflict, retrying once");
            attempt = ingest_group(shared, &mut conn, &group).await;
        }
        match attempt {
            Ok(()) => {
                shared.counters.groups_done.fetch_add(1, Ordering::Relaxed);
            }
            Err(StoreError::Cancelled) => break,
            Err(err) => {
                warn!(%group_id, error = %err, "group failed, continuing with the rest");
                shared.failed.lock().unwrap().push(FailedGroup {
                    group_id,
                    error: err.to_string(),
                });
            }
        }
        shared.report_progress();
    }
    // The connection re-enters the pool for non-import use.
    Store::reset_connection(&mut conn).await?;
    debug!(worker_id, "import worker done");
    Ok(())
}

/// Ingests one group: one transaction, chunks of blobs, file-refs and
/// contents copied together so a ref without its content row can never be
/// observed.
async fn ingest_group(
    shared: &Shared,
    conn: &mut sqlx::postgres::PgConnection,
    group: &GroupWork,
) -> StoreResult<()> {
    let chunk_size = shared.store.options().import_chunk_size;
    let (staged, deduped) = assign_versions(group.first_version, &group.items);
    let mut tx = conn.begin().await?;
    let mut refs_buf = CopyBuffer::new();
    let mut text_buf = CopyBuffer::new();
    let mut binary_buf = CopyBuffer::new();
    for chunk in staged.chunks(chunk_size) {
        if shared.cancel.is_cancelled() {
            // Dropping the transaction rolls the group back whole.
            return Err(StoreError::Cancelled);
        }
        refs_buf.clear();
        text_buf.clear();
        binary_buf.clear();
        for row in chunk {
            file_refs::encode_copy_row(&row.file_ref, &mut refs_buf);
            if row.new_content {
                let hash = row.file_ref.content_hash.expect("new content has a hash");
                let payload = shared.source.read_blob(&hash)?;
                let kind = row.file_ref.content_kind();
                let buf = match kind {
                    ContentKind::Text => &mut text_buf,
                    ContentKind::Binary => &mut binary_buf,
                };
                content_store::encode_copy_row(
                    kind,
                    group.group_id,
                    row.file_ref.version_id,
                    &payload,
                    buf,
                );
            }
        }
        file_refs::copy_rows(&mut tx, &refs_buf).await?;
        content_store::copy_rows(&mut tx, ContentKind::Text, &text_buf).await?;
        content_store::copy_rows(&mut tx, ContentKind::Binary, &binary_buf).await?;
        shared
            .counters
            .blobs_done
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        shared.report_progress();
    }
    tx.commit().await?;
    shared.counters.deduped.fetch_add(deduped, Ordering::Relaxed);
    Ok(())
}

/// The dedicated commit writer: batches commits and their graph entries and
/// copies each batch atomically, in parallel with blob ingestion. Planned
/// commits whose graph entries already exist were written by an earlier run
/// and are skipped, so re-running an unchanged stream appends nothing.
async fn write_commits(
    shared: &Shared,
    existing_entries: Vec<crate::commit_graph::GraphEntry>,
    planned: &[CommitRecord],
) -> StoreResult<()> {
    let mut builder = GraphBuilder::new();
    builder.preload(existing_entries);
    let pending: Vec<&CommitRecord> = planned
        .iter()
        .filter(|record| !builder.contains(&record.id))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    let mut conn = shared.store.pool().acquire().await?;
    Store::tune_connection(&mut conn).await?;
    let mut commit_buf = CopyBuffer::new();
    let mut graph_buf = CopyBuffer::new();
    for batch in pending.chunks(COMMIT_BATCH) {
        if shared.cancel.is_cancelled() {
            break;
        }
        commit_buf.clear();
        graph_buf.clear();
        for record in batch {
            commit_store::encode_copy_row(record, &mut commit_buf);
            let entry = builder.push(record.id.clone(), record.parent_id.as_ref());
            commit_graph::encode_copy_row(entry, &mut graph_buf);
        }
        // Commit and graph rows land atomically per batch.
        let mut tx = conn.begin().await?;
        commit_store::copy_rows(&mut tx, &commit_buf).await?;
        commit_graph::copy_rows(&mut tx, &graph_buf).await?;
        tx.commit().await?;
        shared
            .counters
            .commits_done
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        shared.report_progress();
    }
    Store::reset_connection(&mut conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use chrono::Utc;

    use super::*;
    use crate::object_id::TimeTokenGenerator;

    fn item(path_id: i32, commit_id: &CommitId, hash: Option<ContentHash>) -> WorkItem {
        WorkItem {
            path_id: PathId(path_id),
            commit_id: commit_id.clone(),
            blob: SourceBlob {
                path: format!("p{path_id}"),
                hash,
                mode: 0o100644,
                is_symlink: false,
                symlink_target: None,
                is_binary: false,
            },
        }
    }

    #[test]
    fn test_assign_versions_monotonic_and_contiguous() {
        let tokens = TimeTokenGenerator::new();
        let c = tokens.next_now();
        let items = vec![
            item(1, &c, Some(ContentHash::of(b"v1"))),
            item(1, &c, Some(ContentHash::of(b"v2"))),
            item(2, &c, Some(ContentHash::of(b"v3"))),
        ];
        let (staged, deduped) = assign_versions(VersionId(1), &items);
        let versions: Vec<i32> = staged.iter().map(|s| s.file_ref.version_id.value()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(deduped, 0);
        assert!(staged.iter().all(|s| s.new_content));
    }

    #[test]
    fn test_assign_versions_dedups_equal_content() {
        let tokens = TimeTokenGenerator::new();
        let c = tokens.next_now();
        let same = Some(ContentHash::of(b"hello world\n"));
        let items = vec![
            item(1, &c, same),
            item(2, &c, same),
            item(3, &c, Some(ContentHash::of(b"other"))),
        ];
        let (staged, deduped) = assign_versions(VersionId(1), &items);
        assert_eq!(deduped, 1);
        // The dedup hit reuses version 1 and stages no content row.
        assert_eq!(staged[1].file_ref.version_id, VersionId(1));
        assert!(!staged[1].new_content);
        // The next distinct payload continues the counter without a gap.
        assert_eq!(staged[2].file_ref.version_id, VersionId(2));
    }

    #[test]
    fn test_assign_versions_deletion_consumes_version() {
        let tokens = TimeTokenGenerator::new();
        let c = tokens.next_now();
        let items = vec![
            item(1, &c, Some(ContentHash::of(b"v1"))),
            item(1, &c, None),
            item(1, &c, Some(ContentHash::of(b"v2"))),
        ];
        let (staged, _) = assign_versions(VersionId(1), &items);
        assert_eq!(staged[1].file_ref.version_id, VersionId(2));
        assert!(staged[1].file_ref.is_tombstone());
        assert!(!staged[1].new_content);
        assert_eq!(staged[2].file_ref.version_id, VersionId(3));
    }

    #[test]
    fn test_assign_versions_resumes_counter() {
        let tokens = TimeTokenGenerator::new();
        let c = tokens.next_now();
        let items = vec![item(1, &c, Some(ContentHash::of(b"x")))];
        let (staged, _) = assign_versions(VersionId(42), &items);
        assert_eq!(staged[0].file_ref.version_id, VersionId(42));
    }

    fn blob(path: &str, payload: &[u8]) -> SourceBlob {
        SourceBlob {
            path: path.to_owned(),
            hash: Some(ContentHash::of(payload)),
            mode: 0o100644,
            is_symlink: false,
            symlink_target: None,
            is_binary: false,
        }
    }

    fn commit(message: &str, at_ms: i64, blobs: Vec<SourceBlob>) -> SourceCommit {
        let signature = Signature {
            name: "Ada".to_owned(),
            email: "ada@example.com".to_owned(),
            at: Utc.timestamp_millis_opt(at_ms).unwrap(),
        };
        SourceCommit {
            message: message.to_owned(),
            author: signature.clone(),
            committer: signature,
            tree_hash: None,
            blobs,
        }
    }

    #[test]
    fn test_plan_commits_is_deterministic() {
        let commits = vec![
            commit("one", 1_000, vec![blob("a", b"1")]),
            commit("two", 2_000, vec![blob("a", b"2"), blob("b", b"3")]),
        ];
        let first = plan_commits(&commits);
        let second = plan_commits(&commits);
        assert_eq!(first, second);
        assert_eq!(first[1].parent_id.as_ref(), Some(&first[0].id));
        // A changed stream yields different ids.
        let other = plan_commits(&[
            commit("one", 1_000, vec![blob("a", b"1")]),
            commit("two", 2_000, vec![blob("a", b"changed")]),
        ]);
        assert_eq!(other[0].id, first[0].id);
        assert_ne!(other[1].id, first[1].id);
    }

    #[test]
    fn test_plan_commits_ids_sort_chronologically() {
        // Tied and backward author clocks still produce strictly
        // increasing tokens.
        let commits = vec![
            commit("a", 5_000, vec![blob("x", b"1")]),
            commit("b", 5_000, vec![blob("x", b"2")]),
            commit("c", 4_000, vec![blob("x", b"3")]),
        ];
        let planned = plan_commits(&commits);
        assert!(planned[0].id < planned[1].id);
        assert!(planned[1].id < planned[2].id);
        // An extended stream keeps the prefix ids stable.
        let mut longer = commits.clone();
        longer.push(commit("d", 6_000, vec![blob("x", b"4")]));
        let replanned = plan_commits(&longer);
        for (a, b) in planned.iter().zip(&replanned) {
            assert_eq!(a.id, b.id);
        }
        assert_eq!(replanned[3].parent_id.as_ref(), Some(&planned[2].id));
    }

    #[test]
    fn test_plan_groups_buckets_by_group_in_stream_order() {
        let commits = vec![
            commit("one", 1_000, vec![blob("a", b"1"), blob("b", b"2")]),
            commit("two", 2_000, vec![blob("a", b"3")]),
        ];
        let records = plan_commits(&commits);
        let registered: HashMap<String, RegisteredPath> = [("a", 1, 10), ("b", 2, 20)]
            .into_iter()
            .map(|(path, path_id, group_id)| {
                (
                    path.to_owned(),
                    RegisteredPath {
                        path_id: PathId(path_id),
                        group_id: GroupId(group_id),
                        path: path.to_owned(),
                    },
                )
            })
            .collect();
        let work = plan_groups(&commits, &records, &registered);
        assert_eq!(work.len(), 2);
        let group_a = work.iter().find(|w| w.group_id == GroupId(10)).unwrap();
        assert_eq!(group_a.items.len(), 2);
        // Stream order within the group: commit one's blob before commit
        // two's.
        assert_eq!(group_a.items[0].commit_id, records[0].id);
        assert_eq!(group_a.items[1].commit_id, records[1].id);
    }
}
