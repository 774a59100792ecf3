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

//! Per-commit file metadata: one row per `(path, commit)` where the file
//! changed. A row with a NULL content hash is a tombstone: it consumes a
//! `version_id`, stays visible to history queries, and hides the path from
//! tree queries.
//!
//! Everything here is metadata-only; content bytes are fetched separately
//! through the content store, so status/ls-tree/diff-names never touch the
//! chains.

use sqlx::PgConnection;
use sqlx::PgPool;
use sqlx::Row as _;
use sqlx::postgres::PgRow;

use crate::content_store::ContentKind;
use crate::copy::CopyBuffer;
use crate::object_id::CommitId;
use crate::object_id::ContentHash;
use crate::object_id::GroupId;
use crate::object_id::PathId;
use crate::object_id::VersionId;
use crate::store::StoreResult;

/// One row of `pgit_file_refs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRef {
    pub path_id: PathId,
    pub commit_id: CommitId,
    pub version_id: VersionId,
    /// `None` means the file was deleted at this commit.
    pub content_hash: Option<ContentHash>,
    pub mode: i32,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
    pub is_binary: bool,
}

impl FileRef {
    pub fn is_tombstone(&self) -> bool {
        self.content_hash.is_none()
    }

    pub fn content_kind(&self) -> ContentKind {
        ContentKind::from_is_binary(self.is_binary)
    }
}

/// A file-ref joined back through the path registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRefEntry {
    pub path: String,
    pub group_id: GroupId,
    pub file_ref: FileRef,
}

const REF_COLUMNS: &str = "f.path_id, f.commit_id, f.version_id, f.content_hash, \
                           f.mode, f.is_symlink, f.symlink_target, f.is_binary";

pub struct FileRefStore {
    pool: PgPool,
}

impl FileRefStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, file_ref: &FileRef) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pgit_file_refs
                 (path_id, commit_id, version_id, content_hash, mode,
                  is_symlink, symlink_target, is_binary)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(file_ref.path_id.value())
        .bind(file_ref.commit_id.as_str())
        .bind(file_ref.version_id.value())
        .bind(file_ref.content_hash.as_ref().map(ContentHash::as_bytes))
        .bind(file_ref.mode)
        .bind(file_ref.is_symlink)
        .bind(file_ref.symlink_target.as_deref())
        .bind(file_ref.is_binary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads one ref by primary key. A missing row is `None`, not an error.
    pub async fn get(
        &self,
        path_id: PathId,
        commit_id: &CommitId,
    ) -> StoreResult<Option<FileRef>> {
        let row = sqlx::query(&format!(
            "SELECT {REF_COLUMNS} FROM pgit_file_refs f
             WHERE f.path_id = $1 AND f.commit_id = $2"
        ))
        .bind(path_id.value())
        .bind(commit_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| file_ref_from_row(&row)).transpose()
    }

    /// The latest ref for a path at or before `commit`, tombstone or not.
    pub async fn latest_at(
        &self,
        path_id: PathId,
        commit_id: &CommitId,
    ) -> StoreResult<Option<FileRef>> {
        let row = sqlx::query(&format!(
            "SELECT {REF_COLUMNS} FROM pgit_file_refs f
             WHERE f.path_id = $1 AND f.commit_id <= $2
             ORDER BY f.commit_id DESC
             LIMIT 1"
        ))
        .bind(path_id.value())
        .bind(commit_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| file_ref_from_row(&row)).transpose()
    }

    /// The files changed at exactly this commit (including deletions).
    pub async fn changed_at(&self, commit_id: &CommitId) -> StoreResult<Vec<FileRefEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {REF_COLUMNS}, p.path, p.group_id
             FROM pgit_file_refs f
             JOIN pgit_paths p ON p.path_id = f.path_id
             WHERE f.commit_id = $1
             ORDER BY p.path"
        ))
        .bind(commit_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Reconstructs the tree at a commit: the latest surviving version of
    /// every path, with tombstones dropped.
    pub async fn tree_at(&self, commit_id: &CommitId) -> StoreResult<Vec<FileRefEntry>> {
        let rows = sqlx::query(
            "SELECT latest.* FROM (
                 SELECT DISTINCT ON (f.path_id)
                        f.path_id, f.commit_id, f.version_id, f.content_hash,
                        f.mode, f.is_symlink, f.symlink_target, f.is_binary,
                        p.path, p.group_id
                 FROM pgit_file_refs f
                 JOIN pgit_paths p ON p.path_id = f.path_id
                 WHERE f.commit_id <= $1
                 ORDER BY f.path_id, f.commit_id DESC
             ) latest
             WHERE latest.content_hash IS NOT NULL
             ORDER BY latest.path",
        )
        .bind(commit_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Walks the change history of one path, newest first.
    pub async fn history(
        &self,
        path_id: PathId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<FileRef>> {
        let rows = sqlx::query(&format!(
            "SELECT {REF_COLUMNS} FROM pgit_file_refs f
             WHERE f.path_id = $1
             ORDER BY f.commit_id DESC
             LIMIT $2"
        ))
        .bind(path_id.value())
        .bind(limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| file_ref_from_row(row)).collect()
    }

    /// The refs of every change in `(since, until]`.
    pub async fn changed_between(
        &self,
        since: &CommitId,
        until: &CommitId,
    ) -> StoreResult<Vec<FileRefEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {REF_COLUMNS}, p.path, p.group_id
             FROM pgit_file_refs f
             JOIN pgit_paths p ON p.path_id = f.path_id
             WHERE f.commit_id > $1 AND f.commit_id <= $2
             ORDER BY f.commit_id, p.path"
        ))
        .bind(since.as_str())
        .bind(until.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// All text refs eligible for history-wide search: non-binary,
    /// non-deleted, optionally capped at a commit.
    pub(crate) async fn searchable_text_refs(
        &self,
        until: Option<&CommitId>,
    ) -> StoreResult<Vec<FileRefEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {REF_COLUMNS}, p.path, p.group_id
             FROM pgit_file_refs f
             JOIN pgit_paths p ON p.path_id = f.path_id
             WHERE NOT f.is_binary
               AND f.content_hash IS NOT NULL
               AND ($1::text IS NULL OR f.commit_id <= $1)"
        ))
        .bind(until.map(CommitId::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// The `(path_id, commit_id)` keys already present for the given paths.
    /// The import pipeline uses this to drop work that an earlier run made
    /// durable, so a resumed stream re-ingests exactly what is missing.
    pub(crate) async fn existing_keys_for_paths(
        &self,
        path_ids: &[PathId],
    ) -> StoreResult<std::collections::HashSet<(PathId, CommitId)>> {
        let ids: Vec<i32> = path_ids.iter().map(|p| p.value()).collect();
        let rows = sqlx::query(
            "SELECT path_id, commit_id FROM pgit_file_refs WHERE path_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    PathId(row.try_get("path_id")?),
                    CommitId::new(row.try_get("commit_id")?),
                ))
            })
            .collect()
    }

    /// Lowest `version_id` per group among the refs of the given commits.
    /// Pruning truncates each group's chain at that point.
    pub(crate) async fn min_versions_of_commits(
        &self,
        commit_ids: &[CommitId],
    ) -> StoreResult<Vec<(GroupId, VersionId)>> {
        let owned: Vec<String> = commit_ids
            .iter()
            .map(|id| id.as_str().to_owned())
            .collect();
        let rows = sqlx::query(
            "SELECT p.group_id, MIN(f.version_id) AS min_version
             FROM pgit_file_refs f
             JOIN pgit_paths p ON p.path_id = f.path_id
             WHERE f.commit_id = ANY($1)
             GROUP BY p.group_id",
        )
        .bind(&owned)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    GroupId(row.try_get("group_id")?),
                    VersionId(row.try_get("min_version")?),
                ))
            })
            .collect()
    }
}

/// Appends one file-ref to a COPY buffer.
pub(crate) fn encode_copy_row(file_ref: &FileRef, buf: &mut CopyBuffer) {
    buf.int(file_ref.path_id.value());
    buf.text(file_ref.commit_id.as_str());
    buf.int(file_ref.version_id.value());
    buf.opt_bytea(file_ref.content_hash.as_ref().map(ContentHash::as_bytes));
    buf.int(file_ref.mode);
    buf.bool(file_ref.is_symlink);
    buf.opt_text(file_ref.symlink_target.as_deref());
    buf.bool(file_ref.is_binary);
    buf.end_row();
}

/// Streams a prepared COPY buffer into `pgit_file_refs`.
pub(crate) async fn copy_rows(conn: &mut PgConnection, buf: &CopyBuffer) -> StoreResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut sink = conn
        .copy_in_raw(
            "COPY pgit_file_refs (path_id, commit_id, version_id, content_hash, mode, \
             is_symlink, symlink_target, is_binary) FROM STDIN WITH (FORMAT text)",
        )
        .await?;
    sink.send(buf.as_bytes()).await?;
    sink.finish().await?;
    Ok(())
}

pub(crate) fn file_ref_from_row(row: &PgRow) -> StoreResult<FileRef> {
    let hash_bytes: Option<Vec<u8>> = row.try_get("content_hash")?;
    let content_hash = hash_bytes
        .map(|bytes| ContentHash::from_bytes(&bytes))
        .transpose()?;
    Ok(FileRef {
        path_id: PathId(row.try_get("path_id")?),
        commit_id: CommitId::new(row.try_get("commit_id")?),
        version_id: VersionId(row.try_get("version_id")?),
        content_hash,
        mode: row.try_get("mode")?,
        is_symlink: row.try_get("is_symlink")?,
        symlink_target: row.try_get("symlink_target")?,
        is_binary: row.try_get("is_binary")?,
    })
}

fn entry_from_row(row: &PgRow) -> StoreResult<FileRefEntry> {
    Ok(FileRefEntry {
        path: row.try_get("path")?,
        group_id: GroupId(row.try_get("group_id")?),
        file_ref: file_ref_from_row(row)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::TimeTokenGenerator;

    fn sample_ref(hash: Option<ContentHash>) -> FileRef {
        FileRef {
            path_id: PathId(1),
            commit_id: TimeTokenGenerator::new().next_now(),
            version_id: VersionId(1),
            content_hash: hash,
            mode: 0o100644,
            is_symlink: false,
            symlink_target: None,
            is_binary: false,
        }
    }

    #[test]
    fn test_tombstone() {
        assert!(sample_ref(None).is_tombstone());
        assert!(!sample_ref(Some(ContentHash::of(b"x"))).is_tombstone());
    }

    #[test]
    fn test_copy_row_encodes_tombstone_hash_as_null() {
        let mut buf = CopyBuffer::new();
        let file_ref = sample_ref(None);
        encode_copy_row(&file_ref, &mut buf);
        let line = String::from_utf8(buf.as_bytes().to_vec()).unwrap();
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[3], "\\N");
        assert_eq!(fields[5], "f");
        assert_eq!(fields[6], "\\N");
    }

    #[test]
    fn test_copy_row_encodes_hash_as_hex_bytea() {
        let mut buf = CopyBuffer::new();
        let hash = ContentHash::of(b"hello\n");
        let file_ref = sample_ref(Some(hash));
        encode_copy_row(&file_ref, &mut buf);
        let line = String::from_utf8(buf.as_bytes().to_vec()).unwrap();
        assert!(line.contains(&format!("\\\\x{}", hash.hex())));
    }
}
