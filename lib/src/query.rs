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

//! The read surface: tree materialization, file and history lookups, diffs,
//! and commit pruning. Metadata comes from the file-ref store; content is
//! batch-loaded through the content store's grouping-aware reads.

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::commit_store;
use crate::commit_store::CommitRecord;
use crate::commit_store::CommitStore;
use crate::content_store::ContentKey;
use crate::content_store::ContentStore;
use crate::file_refs::FileRef;
use crate::file_refs::FileRefEntry;
use crate::file_refs::FileRefStore;
use crate::object_id::CommitId;
use crate::paths::PathRegistry;
use crate::refs::RefStore;
use crate::schema;
use crate::schema::ChainedTable;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;

/// A file materialized with its payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedFile {
    pub path: String,
    pub file_ref: FileRef,
    pub content: Vec<u8>,
}

/// One change in a diff range: the payload is `None` for deletions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    pub file_ref: FileRef,
    pub content: Option<Vec<u8>>,
}

/// One step in a path's history.
#[derive(Clone, Debug)]
pub struct PathHistoryEntry {
    pub commit: CommitRecord,
    pub file_ref: FileRef,
}

pub struct QueryEngine {
    pool: PgPool,
    paths: PathRegistry,
    file_refs: FileRefStore,
    contents: ContentStore,
    commits: CommitStore,
    refs: RefStore,
}

impl Store {
    pub fn queries(&self) -> QueryEngine {
        QueryEngine {
            pool: self.pool().clone(),
            paths: self.paths(),
            file_refs: self.file_refs(),
            contents: self.contents(),
            commits: self.commits(),
            refs: self.refs(),
        }
    }
}

impl QueryEngine {
    /// The tree at a commit, metadata only.
    pub async fn tree_at(&self, commit_id: &CommitId) -> StoreResult<Vec<FileRefEntry>> {
        self.file_refs.tree_at(commit_id).await
    }

    /// The tree at a commit with every payload loaded, batched through the
    /// grouping-aware content reads.
    #[instrument(skip_all, fields(commit = %commit_id))]
    pub async fn tree_with_contents(
        &self,
        commit_id: &CommitId,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<MaterializedFile>> {
        let entries = self.file_refs.tree_at(commit_id).await?;
        self.materialize(entries, cancel).await
    }

    /// One file at a commit: the latest ref at or before it, then one
    /// content fetch by primary key. A path that never existed and a path
    /// deleted at this point both come back as `None`.
    pub async fn file_at(
        &self,
        path: &str,
        commit_id: &CommitId,
    ) -> StoreResult<Option<MaterializedFile>> {
        let Some(registered) = self.paths.lookup(path).await? else {
            return Ok(None);
        };
        let Some(file_ref) = self.file_refs.latest_at(registered.path_id, commit_id).await? else {
            return Ok(None);
        };
        if file_ref.is_tombstone() {
            return Ok(None);
        }
        let content = self
            .contents
            .read(
                file_ref.content_kind(),
                registered.group_id,
                file_ref.version_id,
            )
            .await?
            .ok_or(StoreError::MissingContent {
                group_id: registered.group_id,
                version_id: file_ref.version_id,
            })?;
        Ok(Some(MaterializedFile {
            path: registered.path,
            file_ref,
            content,
        }))
    }

    /// Every change in `(since, until]`, with payloads for the survivors.
    #[instrument(skip_all, fields(since = %since, until = %until))]
    pub async fn changed_files(
        &self,
        since: &CommitId,
        until: &CommitId,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<ChangedFile>> {
        let entries = self.file_refs.changed_between(since, until).await?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let keys: Vec<ContentKey> = entries
            .iter()
            .filter(|e| !e.file_ref.is_tombstone())
            .map(|e| ContentKey {
                kind: e.file_ref.content_kind(),
                group_id: e.group_id,
                version_id: e.file_ref.version_id,
            })
            .collect();
        let contents = self.contents.read_batch(&keys).await?;
        entries
            .into_iter()
            .map(|entry| {
                // Deduped refs may share one content row, so look up by
                // reference rather than draining the map.
                let content = if entry.file_ref.is_tombstone() {
                    None
                } else {
                    Some(
                        contents
                            .get(&(entry.group_id, entry.file_ref.version_id))
                            .cloned()
                            .ok_or(StoreError::MissingContent {
                                group_id: entry.group_id,
                                version_id: entry.file_ref.version_id,
                            })?,
                    )
                };
                Ok(ChangedFile {
                    path: entry.path,
                    file_ref: entry.file_ref,
                    content,
                })
            })
            .collect()
    }

    /// The change history of one path joined to its commits, newest first.
    /// An unregistered path yields an empty history.
    pub async fn history(
        &self,
        path: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<PathHistoryEntry>> {
        let Some(registered) = self.paths.lookup(path).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT f.path_id, f.commit_id, f.version_id, f.content_hash, f.mode,
                    f.is_symlink, f.symlink_target, f.is_binary,
                    c.id, c.parent_id, c.tree_hash, c.message,
                    c.author_name, c.author_email, c.authored_at,
                    c.committer_name, c.committer_email, c.committed_at
             FROM pgit_file_refs f
             JOIN pgit_commits c ON c.id = f.commit_id
             WHERE f.path_id = $1
             ORDER BY f.commit_id DESC
             LIMIT $2",
        )
        .bind(registered.path_id.value())
        .bind(limit.map_or(i64::MAX, |l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PathHistoryEntry {
                    commit: commit_store::commit_from_row(row)?,
                    file_ref: crate::file_refs::file_ref_from_row(row)?,
                })
            })
            .collect()
    }

    /// Deletes the commits at and above `from` and truncates every affected
    /// content chain: one delete per group at the lowest pruned version, the
    /// access method cascades upward from there. `HEAD` is repointed at the
    /// surviving tip.
    #[instrument(skip_all, fields(from = %from))]
    pub async fn prune_commits_from(&self, from: &CommitId) -> StoreResult<u64> {
        let doomed_ids = self.commits.ids_from(from).await?;
        let anchors = self.file_refs.min_versions_of_commits(&doomed_ids).await?;
        for (group_id, version_id) in anchors {
            // Tombstones hold versions without content rows, so anchor each
            // table at its own lowest surviving slot.
            for kind in [
                crate::content_store::ContentKind::Text,
                crate::content_store::ContentKind::Binary,
            ] {
                self.contents
                    .truncate_at_or_after(kind, group_id, version_id)
                    .await?;
            }
        }
        sqlx::query("DELETE FROM pgit_file_refs WHERE commit_id >= $1")
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        let deleted = self.commits.truncate_from(from).await?;
        schema::refresh_chain_stats(&self.pool, &ChainedTable::ALL).await?;
        match self.commits.latest().await? {
            Some(tip) => self.refs.set_head(&tip.id).await?,
            None => {
                self.refs.delete_ref(crate::refs::HEAD).await?;
            }
        }
        Ok(deleted)
    }

    async fn materialize(
        &self,
        entries: Vec<FileRefEntry>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<MaterializedFile>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let keys: Vec<ContentKey> = entries
            .iter()
            .map(|e| ContentKey {
                kind: e.file_ref.content_kind(),
                group_id: e.group_id,
                version_id: e.file_ref.version_id,
            })
            .collect();
        let contents = self.contents.read_batch(&keys).await?;
        entries
            .into_iter()
            .map(|entry| {
                let content = contents
                    .get(&(entry.group_id, entry.file_ref.version_id))
                    .cloned()
                    .ok_or(StoreError::MissingContent {
                        group_id: entry.group_id,
                        version_id: entry.file_ref.version_id,
                    })?;
                Ok(MaterializedFile {
                    path: entry.path,
                    file_ref: entry.file_ref,
                    content,
                })
            })
            .collect()
    }
}
